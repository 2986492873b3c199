//! Liveness and readiness endpoints
//!
//! `/healthz` answers as soon as the process serves HTTP. `/readyz` turns
//! 200 once startup has finished and the repo bootstrap succeeded.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use meshfleet_common::{Error, Result};

/// Shared readiness flag
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    /// Flag starting not ready
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark ready or not ready
    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    /// Current state
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Router serving `/healthz` and `/readyz`
pub fn health_router(readiness: Readiness) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(readiness)
}

async fn readyz(State(readiness): State<Readiness>) -> (StatusCode, &'static str) {
    if readiness.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Serve the health endpoints on `addr` until `cancel` fires
pub async fn serve_health(
    addr: SocketAddr,
    readiness: Readiness,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::fatal(format!("failed to bind health server on {addr}: {e}")))?;
    info!(%addr, "health server listening");
    axum::serve(listener, health_router(readiness))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::internal_with_context("health_server", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn status(router: Router, path: &str) -> StatusCode {
        router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn healthz_is_always_ok() {
        let router = health_router(Readiness::new());
        assert_eq!(status(router, "/healthz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_follows_the_flag() {
        let readiness = Readiness::new();
        assert_eq!(
            status(health_router(readiness.clone()), "/readyz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        readiness.set(true);
        assert_eq!(
            status(health_router(readiness.clone()), "/readyz").await,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let router = health_router(Readiness::new());
        assert_eq!(status(router, "/metrics").await, StatusCode::NOT_FOUND);
    }
}
