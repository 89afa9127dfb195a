//! Router configuration for the HTTP API.
//!
//! This module sets up all routes, middleware (CORS, compression, tracing),
//! and creates the axum router ready for serving.

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::state::AppState;

/// Create the main application router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        // GCN events
        .route(
            "/gcn_event",
            get(handlers::list_gcn_events).post(handlers::post_gcn_event),
        )
        .route(
            "/gcn_event/{dateobs}",
            get(handlers::get_gcn_event).delete(handlers::delete_gcn_event),
        )
        // Localizations
        .route(
            "/localization/{dateobs}/name/{name}",
            get(handlers::get_localization).delete(handlers::delete_localization),
        )
        .route(
            "/localization/{dateobs}/name/{name}/tiles",
            post(handlers::retile_localization),
        )
        .route(
            "/localization/{dateobs}/name/{name}/point",
            get(handlers::point_query),
        )
        .route(
            "/localization/{dateobs}/name/{name}/fields",
            post(handlers::fields_query),
        )
        .route(
            "/localization/{dateobs}/name/{name}/credible_region",
            get(handlers::credible_region),
        )
        // Follow-up requests
        .route("/followup_request", post(handlers::create_followup_request))
        .route(
            "/followup_request/{id}",
            get(handlers::get_followup_request).delete(handlers::delete_followup_request),
        )
        // Job management
        .route("/jobs/{job_id}", get(handlers::get_job_status))
        .route("/jobs/{job_id}/logs", get(handlers::stream_job_logs));

    let body_limit = state.body_limit_bytes;
    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api", api)
        // Inline FITS skymaps can be large.
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::{FullRepository, LocalRepository};
    use std::sync::Arc;

    #[test]
    fn test_router_creation() {
        let repo = Arc::new(LocalRepository::new()) as Arc<dyn FullRepository>;
        let state = AppState::new(repo, &AppConfig::default()).unwrap();
        let _router = create_router(state);
    }
}
