use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{Json, Router, extract::State, routing::get};

use crate::engine::Engine;
use crate::scheduler::SchedulerStats;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/stats", get(stats))
        .with_state(engine)
}

async fn stats(State(engine): State<Arc<Engine>>) -> Json<SchedulerStats> {
    Json(engine.scheduler().stats())
}

/// Prosty serwer HTTP: healthcheck + liczniki kolejki skanów.
pub async fn serve(addr: SocketAddr, engine: Arc<Engine>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "status endpoint listening");
    axum::serve(listener, router(engine)).await?;
    Ok(())
}
