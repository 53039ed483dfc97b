use std::sync::Arc;

use imagegen_comfyui::worker::Worker;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheap to clone: everything is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// The worker owning the engine.
    pub worker: Arc<Worker>,
}
