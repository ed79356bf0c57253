pub mod handlers;
pub mod relay;
pub mod routes;
pub mod state;

use std::net::SocketAddr;

pub use state::AppState;

/// Server error types for proper error handling.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),

    #[error("Server runtime error: {0}")]
    RuntimeError(String),
}

/// Start the HTTP server on the configured address.
///
/// Serves only the read surface: playlist, guide, stream relay, status and
/// health. Connect info is attached so the relay can log client addresses.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let addr = state.config().bind_addr;
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on http://{}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| ServerError::RuntimeError(e.to_string()))?;

    Ok(())
}
