//! Liveness/readiness probe endpoint for the deployment itself. Worker
//! health is deliberately not reflected here.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(ready): State<Arc<AtomicBool>>) -> StatusCode {
    if ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Serve `/healthz` and `/readyz` until cancelled.
pub fn spawn(
    addr: SocketAddr,
    ready: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let app = Router::new()
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz))
            .with_state(ready);
        info!(addr = %addr, "probe endpoint listening");
        axum::Server::try_bind(&addr)
            .context("cannot bind probe endpoint")?
            .serve(app.into_make_service())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .context("probe endpoint failed")
    })
}
