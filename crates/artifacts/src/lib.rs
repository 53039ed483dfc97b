//! Shared model cache for imagegen workers.
//!
//! Artifacts are downloaded once into a cache root shared between workers
//! ([`populate`]) and exposed to the engine through per-type symlinks
//! ([`provision`]). [`audit`] reports on both without changing anything.

pub mod audit;
pub mod error;
pub mod populate;
pub mod provision;
pub mod registry;
