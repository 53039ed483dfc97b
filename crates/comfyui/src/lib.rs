//! ComfyUI engine integration for the imagegen worker.
//!
//! The engine runs as a long-lived subprocess. This crate launches it,
//! watches its health, and executes request-scoped graphs on it one at a
//! time:
//!
//! - [`api`] - HTTP client for the engine's REST endpoints
//! - [`health`] - liveness probe trait and HTTP implementation
//! - [`launcher`] - one-shot engine launch
//! - [`supervisor`] - worker lifecycle state and health supervision
//! - [`executor`] - graph file, engine client invocation, output lookup
//! - [`serializer`] - FIFO single-slot admission to the engine
//! - [`worker`] - the composed request path

pub mod api;
pub mod executor;
pub mod health;
pub mod launcher;
pub mod process;
pub mod serializer;
pub mod supervisor;
pub mod worker;
