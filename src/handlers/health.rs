use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Liveness check.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
