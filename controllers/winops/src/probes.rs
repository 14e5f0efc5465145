//! Liveness and readiness endpoints.
//!
//! - `GET /healthz`: always `ok` while the process serves requests
//! - `GET /readyz`: `ok` once the first reconciliation pass has completed

use crate::error::ControllerError;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Build the probe router over the readiness flag
pub fn probe_routes(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(ready)
}

async fn readyz(State(ready): State<Arc<AtomicBool>>) -> (StatusCode, &'static str) {
    if ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "waiting for first reconciliation")
    }
}

/// Serve the probes on `addr` until the server fails
pub async fn serve_probes(addr: SocketAddr, ready: Arc<AtomicBool>) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Health probes listening on {}", addr);
    axum::serve(listener, probe_routes(ready)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_readyz_follows_flag() {
        let ready = Arc::new(AtomicBool::new(false));
        let (status, _) = readyz(State(Arc::clone(&ready))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        ready.store(true, Ordering::SeqCst);
        let (status, body) = readyz(State(ready)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }
}
