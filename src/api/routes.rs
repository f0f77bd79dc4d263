use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, options, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.upload.max_upload_size as usize;
    let public_path = format!(
        "{}/*key",
        state.config.upload.public_base_path.trim_end_matches('/')
    );

    // Resumable upload protocol
    let tus = Router::new()
        .route(
            "/files",
            options(handlers::tus_options).post(handlers::create_upload),
        )
        .route(
            "/files/:id",
            axum::routing::patch(handlers::upload_chunk)
                .head(handlers::upload_status)
                .delete(handlers::delete_upload),
        )
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(middleware::map_response(handlers::tus_resumable));

    let mut router = Router::new()
        .merge(tus)
        // Photo lifecycle
        .route("/photos/:id", get(handlers::get_photo))
        .route("/photos/:id", delete(handlers::delete_photo))
        .route("/photos/:id/report", put(handlers::set_report))
        .route("/reports/:report_id/photos", get(handlers::list_report_photos))
        .route(
            "/reports/:report_id/photos",
            delete(handlers::delete_report_photos),
        )
        // Completed upload content
        .route(&public_path, get(handlers::serve_upload))
        // Internal
        .route("/_internal/health", get(handlers::health));

    // Test-only routes
    if state.config.test_mode {
        tracing::warn!("Test mode enabled, purge route is available.");
        router = router.route("/admin/purge", delete(handlers::admin_purge));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
