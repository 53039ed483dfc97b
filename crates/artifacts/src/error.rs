use std::path::PathBuf;

use imagegen_core::artifact::ArtifactType;

/// Errors from fetching an artifact out of the remote registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("registry returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from cache population and link provisioning.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("download of {filename} failed: {source}")]
    Download {
        filename: String,
        #[source]
        source: RegistryError,
    },

    #[error("local artifact {} is not in the cache", path.display())]
    MissingLocal { path: PathBuf },

    /// No consumer directory is configured for this artifact type.
    #[error("no consumer directory configured for artifact type '{0}'")]
    UnknownTarget(ArtifactType),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ArtifactError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
