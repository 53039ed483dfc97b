//! Domain building blocks shared by the imagegen worker and provisioning tool.
//!
//! Everything in this crate is free of engine and network I/O: the node
//! graph model, the request-scoped graph patcher, the reusable backoff
//! policy, and the artifact manifest types.

pub mod artifact;
pub mod backoff;
pub mod error;
pub mod graph;
pub mod patcher;
