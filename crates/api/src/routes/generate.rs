use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use imagegen_core::graph::NodeGraph;
use tower::limit::GlobalConcurrencyLimitLayer;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// POST /api/v1/generate -- run a workflow and return the image bytes.
///
/// The generation runs in its own task: if the client goes away or the
/// request times out, the engine run still completes and cleans up after
/// itself, so the engine is never left with an orphaned job.
async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<NodeGraph>, JsonRejection>,
) -> AppResult<Response> {
    let Json(graph) =
        payload.map_err(|e| AppError::BadRequest(format!("Invalid workflow: {}", e.body_text())))?;
    tracing::info!(nodes = graph.len(), "Received workflow");

    let worker = Arc::clone(&state.worker);
    let artifact = tokio::spawn(async move { worker.generate(&graph).await })
        .await
        .map_err(|e| AppError::InternalError(format!("generation task failed: {e}")))??;

    Ok(([(CONTENT_TYPE, artifact.content_type())], artifact.bytes).into_response())
}

pub fn router(max_concurrent: usize) -> Router<AppState> {
    Router::new()
        .route("/generate", post(generate))
        .route_layer(GlobalConcurrencyLimitLayer::new(max_concurrent))
}
