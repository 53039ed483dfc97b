//! Cache population.
//!
//! Every cache entry becomes visible only through a rename from a hidden
//! partial file in the same directory, so a reader of the cache never sees
//! a half-written artifact. Each fetch writes its own uniquely named partial
//! file, so concurrent populators of one cache never share a temp file; the
//! last rename wins. A failed download removes its partial file and leaves
//! any previous cache entry in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use imagegen_core::artifact::ArtifactDescriptor;

use crate::error::ArtifactError;
use crate::registry::ArtifactSource;

/// Suffix of in-flight download files.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Fresh hidden temporary path for `filename` inside `cache_root`.
///
/// Every call returns a different path.
pub fn partial_path(cache_root: &Path, filename: &str) -> PathBuf {
    let nonce = uuid::Uuid::new_v4().simple();
    cache_root.join(format!(".{filename}.{nonce}{PARTIAL_SUFFIX}"))
}

/// Whether a cache directory entry is an in-flight download.
pub fn is_partial_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX)
}

#[derive(Debug, Clone)]
pub struct PopulateOptions {
    /// Re-download remote artifacts that are already cached.
    pub overwrite: bool,
    /// Maximum downloads in flight.
    pub concurrency: usize,
}

impl Default for PopulateOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            concurrency: 2,
        }
    }
}

/// Result of populating a single descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateOutcome {
    Downloaded { bytes: u64 },
    Cached,
}

#[derive(Debug)]
pub struct PopulateFailure {
    pub filename: String,
    pub error: ArtifactError,
}

#[derive(Debug, Default)]
pub struct PopulateReport {
    pub downloaded: Vec<String>,
    pub cached: Vec<String>,
    pub failed: Vec<PopulateFailure>,
}

impl PopulateReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Descriptors that ended up in the cache.
    pub fn succeeded(&self) -> usize {
        self.downloaded.len() + self.cached.len()
    }
}

/// Fills the cache root from an [`ArtifactSource`].
pub struct Populator {
    source: Arc<dyn ArtifactSource>,
    cache_root: PathBuf,
    options: PopulateOptions,
}

impl Populator {
    pub fn new(source: Arc<dyn ArtifactSource>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            source,
            cache_root: cache_root.into(),
            options: PopulateOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PopulateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Populate every descriptor; failures are collected, never raised.
    ///
    /// When the same filename appears more than once, the last descriptor
    /// wins.
    pub async fn populate(&self, descriptors: &[ArtifactDescriptor]) -> PopulateReport {
        let batch = dedupe(descriptors);
        let results: Vec<_> = stream::iter(batch)
            .map(|d| async move { (d, self.populate_one(d).await) })
            .buffered(self.options.concurrency.max(1))
            .collect()
            .await;

        let mut report = PopulateReport::default();
        for (descriptor, result) in results {
            let filename = descriptor.filename.clone();
            match result {
                Ok(PopulateOutcome::Downloaded { .. }) => report.downloaded.push(filename),
                Ok(PopulateOutcome::Cached) => report.cached.push(filename),
                Err(error) => {
                    tracing::error!(filename = %filename, error = %error, "Artifact not populated");
                    report.failed.push(PopulateFailure { filename, error });
                }
            }
        }

        tracing::info!(
            downloaded = report.downloaded.len(),
            cached = report.cached.len(),
            failed = report.failed.len(),
            "Cache population finished",
        );
        report
    }

    /// Populate a single descriptor, failing fast.
    pub async fn populate_one(
        &self,
        descriptor: &ArtifactDescriptor,
    ) -> Result<PopulateOutcome, ArtifactError> {
        let final_path = descriptor.cache_path(&self.cache_root);

        let Some(remote_id) = descriptor.remote_id.as_deref() else {
            return if is_file(&final_path).await {
                Ok(PopulateOutcome::Cached)
            } else {
                Err(ArtifactError::MissingLocal { path: final_path })
            };
        };

        if !self.options.overwrite && is_file(&final_path).await {
            tracing::debug!(filename = %descriptor.filename, "Already cached");
            return Ok(PopulateOutcome::Cached);
        }

        tokio::fs::create_dir_all(&self.cache_root)
            .await
            .map_err(ArtifactError::io(&self.cache_root))?;
        let partial = partial_path(&self.cache_root, &descriptor.filename);
        let bytes = match self.source.fetch(remote_id, &partial).await {
            Ok(bytes) => bytes,
            Err(source) => {
                remove_if_exists(&partial).await;
                return Err(ArtifactError::Download {
                    filename: descriptor.filename.clone(),
                    source,
                });
            }
        };

        if let Err(e) = replace(&partial, &final_path).await {
            remove_if_exists(&partial).await;
            return Err(e);
        }

        tracing::info!(filename = %descriptor.filename, bytes, "Artifact cached");
        Ok(PopulateOutcome::Downloaded { bytes })
    }
}

/// Atomically move `partial` over `final_path`; the previous entry stays
/// readable until the rename lands.
async fn replace(partial: &Path, final_path: &Path) -> Result<(), ArtifactError> {
    tokio::fs::rename(partial, final_path)
        .await
        .map_err(ArtifactError::io(final_path))
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial file"),
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file())
}

/// Collapse repeated filenames, keeping the position of the first and the
/// contents of the last.
fn dedupe(descriptors: &[ArtifactDescriptor]) -> Vec<&ArtifactDescriptor> {
    let mut batch: Vec<&ArtifactDescriptor> = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        match batch.iter().position(|d| d.filename == descriptor.filename) {
            Some(pos) => {
                tracing::warn!(filename = %descriptor.filename, "Duplicate artifact, last entry wins");
                batch[pos] = descriptor;
            }
            None => batch.push(descriptor),
        }
    }
    batch
}
