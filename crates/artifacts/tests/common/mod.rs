#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use imagegen_artifacts::error::RegistryError;
use imagegen_artifacts::registry::ArtifactSource;
use tokio::io::AsyncWriteExt;

/// In-memory registry. Ids listed in `broken` write a few bytes and then fail.
#[derive(Debug, Default)]
pub struct FakeRegistry {
    blobs: HashMap<String, Vec<u8>>,
    broken: Vec<String>,
    chunk_delay: Option<Duration>,
    fetches: AtomicU32,
}

/// Bytes written per chunk when a chunk delay is set.
const CHUNK: usize = 1000;

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(mut self, id: &str, bytes: &[u8]) -> Self {
        self.blobs.insert(id.to_string(), bytes.to_vec());
        self
    }

    pub fn with_broken(mut self, id: &str) -> Self {
        self.broken.push(id.to_string());
        self
    }

    /// Stream blobs in small chunks with a pause before each one, like a
    /// slow network download.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl ArtifactSource for FakeRegistry {
    async fn fetch(&self, remote_id: &str, dest: &Path) -> Result<u64, RegistryError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let io = |source| RegistryError::Io {
            path: dest.to_path_buf(),
            source,
        };

        if self.broken.iter().any(|id| id == remote_id) {
            let mut file = tokio::fs::File::create(dest).await.map_err(io)?;
            file.write_all(b"trunc").await.map_err(io)?;
            return Err(RegistryError::Status {
                status: 502,
                body: "connection reset mid-transfer".into(),
            });
        }

        match self.blobs.get(remote_id) {
            Some(bytes) => {
                let mut file = tokio::fs::File::create(dest).await.map_err(io)?;
                match self.chunk_delay {
                    Some(delay) => {
                        for chunk in bytes.chunks(CHUNK) {
                            tokio::time::sleep(delay).await;
                            file.write_all(chunk).await.map_err(io)?;
                            file.flush().await.map_err(io)?;
                        }
                    }
                    None => file.write_all(bytes).await.map_err(io)?,
                }
                file.sync_all().await.map_err(io)?;
                Ok(bytes.len() as u64)
            }
            None => Err(RegistryError::Status {
                status: 404,
                body: "not found".into(),
            }),
        }
    }
}

/// Names of the entries in `dir`, sorted.
pub fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
