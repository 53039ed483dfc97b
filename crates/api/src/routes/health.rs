use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use imagegen_comfyui::supervisor::WorkerState;
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Worker lifecycle state.
    pub status: WorkerState,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
}

/// GET /health -- 200 while the worker accepts requests, 503 otherwise.
///
/// Reports the last known state and never probes the engine, so it cannot
/// interfere with a running generation.
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let status = state.worker.state();
    let code = if status.is_accepting() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
