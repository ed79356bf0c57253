use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers::{fallback_handler, health_check, lineup_file, status_json};
use super::relay::stream_relay;
use super::state::AppState;

/// Create the Axum router with all client read endpoints configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status_json))
        .route("/stream/{stream_key}", get(stream_relay))
        // Playlist and guide share the `/{output}.{m3u,xml}` namespace.
        .route("/{filename}", get(lineup_file))
        .fallback(fallback_handler)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
