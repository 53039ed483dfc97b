//! Engine liveness probing.
//!
//! A probe answers one question: does the engine respond right now, within
//! the given timeout? Probes never retry on their own; retrying is the
//! caller's decision (see [`imagegen_core::backoff::BackoffPolicy`]).

use std::time::Duration;

use async_trait::async_trait;

use crate::api::{EngineApi, EngineApiError};

/// Why a probe failed.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),

    #[error("engine unreachable: {0}")]
    Unreachable(String),

    #[error("engine answered with HTTP {status}")]
    BadStatus { status: u16 },
}

/// Something that can check whether the engine is alive.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Issue a single liveness check bounded by `timeout`.
    async fn probe(&self, timeout: Duration) -> Result<(), ProbeError>;
}

/// Probe backed by the engine's `GET /system_stats` endpoint.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    api: EngineApi,
}

impl HttpHealthProbe {
    pub fn new(api: EngineApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, timeout: Duration) -> Result<(), ProbeError> {
        // The request timeout is the primary bound; the outer timeout also
        // covers connection setup stalls.
        match tokio::time::timeout(timeout, self.api.ping(timeout)).await {
            Err(_) => Err(ProbeError::Timeout(timeout)),
            Ok(Ok(Some(stats))) => {
                tracing::trace!(
                    devices = stats.devices.len(),
                    version = ?stats.system.comfyui_version,
                    "Engine answered health probe",
                );
                Ok(())
            }
            Ok(Ok(None)) => {
                tracing::trace!("Engine answered health probe with an unrecognised body");
                Ok(())
            }
            Ok(Err(e)) if e.is_timeout() => Err(ProbeError::Timeout(timeout)),
            Ok(Err(EngineApiError::ApiError { status, .. })) => Err(ProbeError::BadStatus { status }),
            Ok(Err(e)) => Err(ProbeError::Unreachable(e.to_string())),
        }
    }
}
