use axum::{Router, routing::get};
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Assemble the HTTP surface. Chart endpoints belong to the external
/// renderer and are intentionally absent.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::search::search_html))
        .route("/search", get(handlers::search::search_json))
        .route("/config", get(handlers::config_file::serve_config))
        .route("/jobs", get(handlers::jobs::jobs))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
