//! HTTP/WebSocket listener

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::routes::router;
use crate::state::GatewayState;

/// Bind `bind_addr` and serve until `cancel` fires
pub async fn serve(bind_addr: &str, state: Arc<GatewayState>, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    serve_on(listener, state, cancel).await
}

/// Serve on an already bound listener until `cancel` fires
pub async fn serve_on(
    listener: TcpListener,
    state: Arc<GatewayState>,
    cancel: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    tracing::info!("Gateway listening on {}", local_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            tracing::info!("Gateway server shutting down");
        })
        .await
        .context("HTTP server failed")?;

    Ok(())
}
