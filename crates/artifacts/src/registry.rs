//! Remote artifact registry.
//!
//! [`ArtifactSource`] abstracts "download remote id X to path Y".
//! [`CivitaiRegistry`] implements it against CivitAI's model download
//! endpoint, streaming the body to disk so multi-gigabyte checkpoints never
//! sit in memory.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::RegistryError;

/// Public CivitAI host.
pub const CIVITAI_BASE_URL: &str = "https://civitai.com";

/// Environment variable holding the CivitAI API token.
pub const CIVITAI_TOKEN_ENV: &str = "CIVIT_API_KEY";

/// Connection establishment timeout. Transfers themselves are unbounded.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Something artifacts can be downloaded from.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Download `remote_id` into `dest`, creating or truncating it.
    ///
    /// Returns the number of bytes written. On error `dest` may hold a
    /// partial body; the caller owns its cleanup.
    async fn fetch(&self, remote_id: &str, dest: &Path) -> Result<u64, RegistryError>;
}

/// CivitAI model download client.
#[derive(Debug, Clone)]
pub struct CivitaiRegistry {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl CivitaiRegistry {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// Registry at the public host, token taken from [`CIVITAI_TOKEN_ENV`].
    pub fn from_env() -> Result<Self, RegistryError> {
        let token = std::env::var(CIVITAI_TOKEN_ENV).ok();
        if token.is_none() {
            tracing::warn!("{CIVITAI_TOKEN_ENV} not set, gated models will fail to download");
        }
        Self::new(CIVITAI_BASE_URL, token)
    }

    /// Download URL for `remote_id`, without the token.
    pub fn download_url(&self, remote_id: &str) -> String {
        format!("{}/api/download/models/{remote_id}", self.base_url)
    }
}

#[async_trait]
impl ArtifactSource for CivitaiRegistry {
    async fn fetch(&self, remote_id: &str, dest: &Path) -> Result<u64, RegistryError> {
        let url = self.download_url(remote_id);
        tracing::info!(url = %url, dest = %dest.display(), "Downloading artifact");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.query(&[("token", token)]);
        }
        let mut response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(RegistryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let io_err = |source| RegistryError::Io {
            path: dest.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.sync_all().await.map_err(io_err)?;

        tracing::info!(remote_id, bytes = written, "Download finished");
        Ok(written)
    }
}
