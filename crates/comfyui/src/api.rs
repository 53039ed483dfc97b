//! REST client for the engine's HTTP endpoints.
//!
//! The worker only needs the engine's lightweight `/system_stats` endpoint,
//! which answers as soon as the server loop is up and stops answering when
//! the process wedges. Workflow execution goes through the command line (see
//! [`crate::executor`]), not through this client.

use std::time::Duration;

use serde::Deserialize;

/// HTTP client for a single engine instance.
#[derive(Debug, Clone)]
pub struct EngineApi {
    client: reqwest::Client,
    api_url: String,
}

/// Subset of the `/system_stats` payload worth logging.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemStats {
    #[serde(default)]
    pub system: SystemInfo,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub comfyui_version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vram_total: Option<u64>,
    #[serde(default)]
    pub vram_free: Option<u64>,
}

/// Errors from the engine REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum EngineApiError {
    /// The HTTP request itself failed (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The engine returned a non-2xx status code.
    #[error("Engine API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl EngineApiError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(e) if e.is_timeout())
    }
}

impl EngineApi {
    /// Create a new API client for an engine instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Client for an engine listening on the local loopback interface.
    pub fn local(port: u16) -> Self {
        Self::new(format!("http://127.0.0.1:{port}"))
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// `GET /system_stats` where only the status code decides success.
    ///
    /// The body is parsed when it can be; an engine build that answers with
    /// a different payload still counts as up.
    pub async fn ping(&self, timeout: Duration) -> Result<Option<SystemStats>, EngineApiError> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .timeout(timeout)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.json::<SystemStats>().await.ok())
    }

    // ---- private helpers ----

    /// Pass a 2xx response through; anything else becomes
    /// [`EngineApiError::ApiError`] carrying the body text.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, EngineApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(EngineApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}
