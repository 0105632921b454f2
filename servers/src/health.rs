//! # Health Endpoint
//!
//! `GET /health` for registry HTTP checks, and the shared axum serve loop.
//!
//! Binding is split from serving so a taken port fails startup before the
//! process registers itself.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{Router, http::StatusCode, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio::task::JoinError;
use tracing::{info, warn};

/// A router exposing only `GET /health`.
pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Binds the service port on all interfaces.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind http listener on {addr}"))?;
    info!(%addr, "http server listening");
    Ok(listener)
}

/// Serves `app` on an already bound listener until `shutdown` fires.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server failed")?;

    info!("http server stopped");
    Ok(())
}

/// Logs how the spawned server task ended.
pub fn report_exit(exited: Result<Result<()>, JoinError>) {
    match exited {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(error = %format!("{error:#}"), "http server error"),
        Err(error) => warn!(%error, "http server task ended abnormally"),
    }
}
