//! Worker lifecycle and engine health supervision.
//!
//! [`Supervisor`] owns the engine process and the worker's
//! [`WorkerState`]:
//!
//! ```text
//! Booting ──> Ready ──> Degraded ──> Retired
//!    └──────────────────────────────────^
//! ```
//!
//! * Boot launches the engine once, waits a grace period, then polls the
//!   health probe under the startup backoff policy. Failure is terminal.
//! * Before each execution, [`Supervisor::ensure_healthy`] runs a single
//!   short probe. One failure is enough: the engine is known to wedge under
//!   memory pressure and does not recover, so the worker goes straight on to
//!   `Retired` and stops accepting work. Replacing the worker is left to the
//!   orchestration platform, which observes the state through `/health` and
//!   through [`Supervisor::retired`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use imagegen_core::backoff::{BackoffPolicy, RetryError};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::health::{HealthProbe, ProbeError};
use crate::launcher::{EngineLauncher, EngineProcess, LaunchError};

/// Lifecycle state of this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Booting,
    Ready,
    Degraded,
    Retired,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Booting => "booting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Retired => "retired",
        }
    }

    /// Only a ready worker takes new requests.
    pub fn is_accepting(self) -> bool {
        self == Self::Ready
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Retired
    }

    /// Returns the states this state may move to.
    pub fn valid_transitions(self) -> &'static [WorkerState] {
        match self {
            Self::Booting => &[Self::Ready, Self::Retired],
            Self::Ready => &[Self::Degraded, Self::Retired],
            Self::Degraded => &[Self::Retired],
            Self::Retired => &[],
        }
    }

    pub fn can_transition_to(self, next: WorkerState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing knobs for boot and per-request health checks.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Fixed wait after launch before the first readiness probe.
    pub startup_grace: Duration,
    /// Polling policy for the readiness wait (deadline and ceiling).
    pub startup_policy: BackoffPolicy,
    /// Timeout of each readiness probe.
    pub startup_probe_timeout: Duration,
    /// Policy for the pre-execution liveness check.
    pub request_policy: BackoffPolicy,
    /// Timeout of the pre-execution liveness probe.
    pub request_probe_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(10),
            startup_policy: BackoffPolicy::startup(),
            startup_probe_timeout: Duration::from_secs(5),
            request_policy: BackoffPolicy::single_attempt(),
            request_probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    LaunchFailed(#[from] LaunchError),

    #[error("engine launcher exited with status {code:?} before the engine became ready")]
    LauncherExited { code: Option<i32> },

    #[error("engine not ready after {attempts} probe(s): {last_error}")]
    BootTimeout { attempts: u32, last_error: ProbeError },

    #[error("boot cancelled")]
    Cancelled,

    #[error("boot requested while worker is {0}")]
    AlreadyStarted(WorkerState),

    /// The engine failed its liveness check; this worker is retired.
    #[error("engine unhealthy ({state}): {reason}")]
    EngineUnhealthy { state: WorkerState, reason: String },
}

/// Owns the engine process and the worker lifecycle state.
pub struct Supervisor {
    probe: Arc<dyn HealthProbe>,
    launcher: Option<EngineLauncher>,
    config: SupervisorConfig,
    state: watch::Sender<WorkerState>,
    engine: Mutex<Option<EngineProcess>>,
}

impl Supervisor {
    /// Create a supervisor in the `Booting` state.
    ///
    /// With no launcher the engine is assumed to be started externally and
    /// boot only waits for it to answer.
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        launcher: Option<EngineLauncher>,
        config: SupervisorConfig,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Booting);
        Self {
            probe,
            launcher,
            config,
            state,
            engine: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Receive every lifecycle transition.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Resolves once the worker has been retired.
    ///
    /// Wire this into the server's graceful shutdown so a retired worker
    /// stops accepting connections.
    pub async fn retired(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| state.is_terminal()).await;
    }

    /// Launch the engine and wait until it answers.
    ///
    /// On success the worker is `Ready`. Any failure retires the worker; the
    /// caller must not serve traffic and should exit.
    pub async fn boot(&self, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        let state = self.state();
        if state != WorkerState::Booting {
            return Err(SupervisorError::AlreadyStarted(state));
        }

        match self.boot_inner(cancel).await {
            Ok(()) => {
                self.transition(WorkerState::Ready);
                tracing::info!("Engine ready, worker accepting requests");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Engine failed to start, retiring worker");
                self.transition(WorkerState::Retired);
                Err(e)
            }
        }
    }

    /// Pre-execution liveness check.
    ///
    /// Fails immediately if the worker is not `Ready`. Otherwise probes once
    /// with the short request timeout; a failed probe retires the worker.
    pub async fn ensure_healthy(&self) -> Result<(), SupervisorError> {
        let state = self.state();
        if !state.is_accepting() {
            return Err(SupervisorError::EngineUnhealthy {
                state,
                reason: format!("worker is {state}"),
            });
        }

        let timeout = self.config.request_probe_timeout;
        let result = self
            .config
            .request_policy
            .retry(|_| self.probe.probe(timeout))
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let reason = e.into_last_error().to_string();
                self.transition(WorkerState::Degraded);
                tracing::warn!(reason = %reason, "Engine failed liveness probe");
                self.retire(&reason);
                Err(SupervisorError::EngineUnhealthy {
                    state: WorkerState::Degraded,
                    reason,
                })
            }
        }
    }

    /// Move to `Retired` and signal that no new work should be routed here.
    pub fn retire(&self, reason: &str) {
        if self.transition(WorkerState::Retired) {
            tracing::error!(reason, "Worker retired, no longer accepting requests");
        }
    }

    /// Kill the engine process if this supervisor launched it.
    pub async fn shutdown(&self) {
        if let Some(mut engine) = self.engine.lock().await.take() {
            tracing::info!(pid = engine.pid(), "Stopping engine process");
            engine.kill().await;
        }
    }

    // ---- private helpers ----

    async fn boot_inner(&self, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        if let Some(launcher) = &self.launcher {
            let process = launcher.spawn()?;
            *self.engine.lock().await = Some(process);
        }

        tracing::info!(
            grace_ms = self.config.startup_grace.as_millis() as u64,
            "Waiting for engine to start",
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(SupervisorError::Cancelled),
            _ = tokio::time::sleep(self.config.startup_grace) => {}
        }

        let timeout = self.config.startup_probe_timeout;
        let wait = self.config.startup_policy.retry(|attempt| async move {
            if let Some(code) = self.launcher_failure().await {
                // Not retryable: report through the success path.
                return Ok(Some(code));
            }
            match self.probe.probe(timeout).await {
                Ok(()) => {
                    tracing::info!(attempt, "Engine answered readiness probe");
                    Ok(None)
                }
                Err(e) => {
                    tracing::info!(attempt, error = %e, "Engine not ready yet");
                    Err(e)
                }
            }
        });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(SupervisorError::Cancelled),
            outcome = wait => outcome,
        };

        match outcome {
            Ok(None) => Ok(()),
            Ok(Some(code)) => Err(SupervisorError::LauncherExited { code }),
            Err(e) => Err(boot_timeout(e)),
        }
    }

    /// Exit code of the launcher if it has already exited unsuccessfully.
    async fn launcher_failure(&self) -> Option<Option<i32>> {
        let mut engine = self.engine.lock().await;
        let status = engine.as_mut()?.try_status()?;
        if status.success() {
            None
        } else {
            Some(status.code())
        }
    }

    /// Apply a state transition if it is valid. Returns whether it happened.
    fn transition(&self, next: WorkerState) -> bool {
        let mut from = None;
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                from = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            tracing::info!(from = %from, to = %next, "Worker state changed");
        }
        changed
    }
}

fn boot_timeout(e: RetryError<ProbeError>) -> SupervisorError {
    SupervisorError::BootTimeout {
        attempts: e.attempts(),
        last_error: e.into_last_error(),
    }
}
