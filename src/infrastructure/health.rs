//! Worker health endpoints.
//!
//! `/health/live` answers as long as the process runs; `/health/ready`
//! delegates to a caller-supplied probe over the worker's dependencies.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Dependency probe: true when every dependency is reachable.
pub type ReadyProbe = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Serves the health endpoints until the process exits. Spawn as a
/// background task next to the consumer loop.
pub async fn serve(addr: SocketAddr, ready: ReadyProbe) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health/live", get(|| async { StatusCode::OK }))
        .route("/health/ready", get(ready_handler))
        .with_state(ready);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Health endpoints on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ready_handler(State(probe): State<ReadyProbe>) -> StatusCode {
    if probe().await {
        StatusCode::OK
    } else {
        warn!("Readiness probe failed");
        StatusCode::SERVICE_UNAVAILABLE
    }
}
