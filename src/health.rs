//! Liveness endpoint for the orchestrator.

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use crate::error::WorkerError;

pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

async fn health() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "message": "ok" })))
}

/// Bind and serve the health router until the process exits.
pub async fn serve(port: u16) -> Result<(), WorkerError> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| WorkerError::Config(format!("binding health endpoint on {addr}: {e}")))?;

    info!("health endpoint listening on {addr}");
    axum::serve(listener, router())
        .await
        .map_err(|e| WorkerError::Config(format!("health endpoint server: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_returns_ok_body() {
        let (status, Json(body)) = health().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "message": "ok" }));
    }
}
