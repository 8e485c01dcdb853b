use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::metrics::metrics_handler;
use crate::AppState;

/// Multipart framing on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn create_router(state: Arc<AppState>) -> Router {
    let upload_limit = (state.config.max_upload_size as usize).saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        // Files
        .route(
            "/files",
            get(handlers::list_files)
                .post(handlers::create_file)
                .layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/files/:id",
            get(handlers::get_file)
                .put(handlers::rename_file)
                .delete(handlers::delete_file),
        )
        .route(
            "/files/:id/content",
            put(handlers::replace_content).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/files/:id/download", get(handlers::download_file))
        .route("/files/:id/url", get(handlers::signed_url))
        .route("/files/:id/restore", post(handlers::restore_file))
        .route("/files/:id/cold", post(handlers::mark_cold))
        .route("/files/:id/warm", post(handlers::mark_warm))
        // Usage
        .route("/quota", get(handlers::quota_usage))
        .route("/bandwidth", get(handlers::bandwidth_usage))
        // Internal
        .route(
            "/_internal/owners/:owner_id/reconcile",
            post(handlers::reconcile_owner),
        )
        .route("/_internal/owners/:owner_id/plan", put(handlers::assign_plan))
        .route("/_internal/lifecycle/sweep", post(handlers::run_sweep))
        .route("/_internal/health", get(handlers::health))
        .route("/_internal/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
