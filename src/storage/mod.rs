pub mod db;
mod files;
pub mod metadata;
pub mod models;
mod tables;

pub use db::{Database, DatabaseError};
pub use metadata::{ContentUpdate, MetadataStore};
pub use tables::*;
