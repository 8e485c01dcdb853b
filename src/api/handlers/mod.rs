mod admin;
mod files;

pub use admin::{assign_plan, health, reconcile_owner, run_sweep};
pub use files::{
    bandwidth_usage, create_file, delete_file, download_file, get_file, list_files, mark_cold,
    mark_warm, quota_usage, rename_file, replace_content, restore_file, signed_url,
};
