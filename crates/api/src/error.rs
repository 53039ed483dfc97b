use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use imagegen_comfyui::executor::ExecutionError;
use imagegen_comfyui::worker::WorkerError;
use imagegen_core::error::CoreError;

/// Application-level error type for HTTP handlers.
///
/// Responses carry a plain-text body, which is what the worker's callers
/// expect alongside raw image bytes on success.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Worker(WorkerError::Patch(core)) => match core {
                CoreError::NoOutputNode { .. } | CoreError::InvalidGraph(_) => {
                    (StatusCode::BAD_REQUEST, core.to_string())
                }
                other => {
                    tracing::error!(error = %other, "Unexpected core error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("Error during inference: {other}"),
                    )
                }
            },

            // The worker has been retired; the platform should route elsewhere.
            AppError::Worker(WorkerError::Supervisor(err)) => {
                (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }

            AppError::Worker(WorkerError::Execution(err @ ExecutionError::Timeout(_))) => {
                (StatusCode::GATEWAY_TIMEOUT, format!("Error during inference: {err}"))
            }

            AppError::Worker(WorkerError::Execution(err)) => {
                tracing::error!(error = %err, "Execution failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Error during inference: {err}"),
                )
            }

            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),

            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };

        (status, message).into_response()
    }
}
