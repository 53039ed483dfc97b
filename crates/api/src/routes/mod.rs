pub mod generate;
pub mod health;

use axum::Router;

use crate::state::AppState;

/// Routes nested under `/api/v1`.
///
/// `max_concurrent` caps generate requests in flight on this worker.
pub fn api_routes(max_concurrent: usize) -> Router<AppState> {
    Router::new().merge(generate::router(max_concurrent))
}
