use axum::{extract::State, http::StatusCode, Json};
use certd_control::Readiness;
use std::sync::Arc;

use crate::models::{HealthResponse, ReadyResponse};

/// Liveness check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Process is alive", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check; 503 until every dependency answers
#[utoipa::path(
    get,
    path = "/ready",
    responses(
        (status = 200, description = "Ready to serve", body = ReadyResponse),
        (status = 503, description = "A dependency is unavailable", body = ReadyResponse)
    ),
    tag = "system"
)]
pub async fn ready(State(readiness): State<Arc<Readiness>>) -> (StatusCode, Json<ReadyResponse>) {
    let report = readiness.check().await;
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report.into()))
}
