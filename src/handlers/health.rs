//! Health and metrics endpoints.

use axum::{extract::State, http::StatusCode, response::Json};
use serde::Serialize;

use super::state::AppState;
use crate::metrics;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_jobs: i64,
}

/// GET /health - liveness.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_jobs: state.tracker.active_jobs(),
    })
}

/// GET /metrics - Prometheus text encoding of the registry.
pub async fn metrics_endpoint() -> Result<String, StatusCode> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let families = metrics::METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
