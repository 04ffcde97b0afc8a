//! HTTP API surface.

mod routes;

pub use routes::router;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::download_manager::PipelineManager;

/// Shared state handed to every route handler.
pub struct ServerState {
    pub manager: Arc<PipelineManager>,
}

/// Serve the API until the shutdown token fires.
pub async fn run_server(
    manager: Arc<PipelineManager>,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let state = Arc::new(ServerState { manager });
    let app = router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!("Listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")?;

    Ok(())
}
