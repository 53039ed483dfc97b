use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use imagegen_comfyui::api::EngineApi;
use imagegen_comfyui::executor::{Executor, ExecutorConfig, OutputRetention, DEFAULT_OUTPUT_DIR};
use imagegen_comfyui::health::HttpHealthProbe;
use imagegen_comfyui::launcher::{EngineLauncher, DEFAULT_ENGINE_PORT};
use imagegen_comfyui::supervisor::{Supervisor, SupervisorConfig};
use imagegen_comfyui::worker::Worker;
use imagegen_core::backoff::BackoffPolicy;
use imagegen_core::patcher::{GraphPatcher, DEFAULT_OUTPUT_KIND};

/// An environment variable that is set but cannot be used.
#[derive(Debug, thiserror::Error)]
#[error("invalid value for {key} ({value:?}): {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// Read `key` through `lookup`, falling back to `default` when unset.
fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

fn string_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// HTTP server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8000`).
    pub port: u16,
    /// Whole-request timeout in seconds (default: `1500`). Must exceed the
    /// engine timeout, otherwise long generations are cut off at the edge.
    pub request_timeout_secs: u64,
    /// Generate requests admitted concurrently (default: `5`). Admitted
    /// requests still run on the engine one at a time.
    pub max_concurrent_requests: usize,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default   |
    /// |---------------------------|-----------|
    /// | `HOST`                    | `0.0.0.0` |
    /// | `PORT`                    | `8000`    |
    /// | `REQUEST_TIMEOUT_SECS`    | `1500`    |
    /// | `MAX_CONCURRENT_REQUESTS` | `5`       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let max_concurrent_requests = parse_or(&lookup, "MAX_CONCURRENT_REQUESTS", 5)?;
        if max_concurrent_requests == 0 {
            return Err(ConfigError {
                key: "MAX_CONCURRENT_REQUESTS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            host: string_or(&lookup, "HOST", "0.0.0.0"),
            port: parse_or(&lookup, "PORT", 8000)?,
            request_timeout_secs: parse_or(&lookup, "REQUEST_TIMEOUT_SECS", 1500)?,
            max_concurrent_requests,
        })
    }
}

/// Runtime link synchronisation run before the engine starts.
#[derive(Debug, Clone)]
pub struct RuntimeLinks {
    pub manifest: PathBuf,
    pub cache_root: PathBuf,
    pub comfy_root: PathBuf,
}

/// Engine and pipeline configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Engine HTTP port (default: `8188`).
    pub engine_port: u16,
    /// Launch the engine at boot (default: `true`). When false the engine is
    /// expected to be started by something else.
    pub launch_engine: bool,
    /// Engine command-line client (default: `comfy`).
    pub comfy_bin: PathBuf,
    pub comfy_workdir: Option<PathBuf>,
    pub workflow_dir: PathBuf,
    pub output_dir: PathBuf,
    pub engine_timeout: Duration,
    pub startup_grace: Duration,
    pub startup_deadline: Duration,
    pub probe_timeout: Duration,
    /// Node kinds treated as output nodes (default: `SaveImage`).
    pub output_kinds: Vec<String>,
    pub retention: OutputRetention,
    pub runtime_links: Option<RuntimeLinks>,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                       |
    /// |-------------------------|-------------------------------|
    /// | `ENGINE_PORT`           | `8188`                        |
    /// | `ENGINE_LAUNCH`         | `true`                        |
    /// | `COMFY_BIN`             | `comfy`                       |
    /// | `COMFY_WORKDIR`         | unset                         |
    /// | `WORKFLOW_DIR`          | system temp dir               |
    /// | `OUTPUT_DIR`            | `/root/comfy/ComfyUI/output`  |
    /// | `ENGINE_TIMEOUT_SECS`   | `1200`                        |
    /// | `STARTUP_GRACE_SECS`    | `10`                          |
    /// | `STARTUP_DEADLINE_SECS` | `60`                          |
    /// | `PROBE_TIMEOUT_SECS`    | `5`                           |
    /// | `OUTPUT_NODE_KINDS`     | `SaveImage`                   |
    /// | `REMOVE_OUTPUTS`        | `false`                       |
    /// | `ARTIFACT_MANIFEST`     | unset (no link sync)          |
    /// | `CACHE_ROOT`            | `/cache`                      |
    /// | `COMFY_ROOT`            | `/root/comfy/ComfyUI`         |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let output_kinds: Vec<String> = string_or(&lookup, "OUTPUT_NODE_KINDS", DEFAULT_OUTPUT_KIND)
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let retention = if parse_or(&lookup, "REMOVE_OUTPUTS", false)? {
            OutputRetention::Remove
        } else {
            OutputRetention::Keep
        };

        let runtime_links = lookup("ARTIFACT_MANIFEST")
            .filter(|v| !v.trim().is_empty())
            .map(|manifest| RuntimeLinks {
                manifest: manifest.into(),
                cache_root: string_or(&lookup, "CACHE_ROOT", "/cache").into(),
                comfy_root: string_or(&lookup, "COMFY_ROOT", "/root/comfy/ComfyUI").into(),
            });

        let workflow_dir = lookup("WORKFLOW_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        Ok(Self {
            engine_port: parse_or(&lookup, "ENGINE_PORT", DEFAULT_ENGINE_PORT)?,
            launch_engine: parse_or(&lookup, "ENGINE_LAUNCH", true)?,
            comfy_bin: string_or(&lookup, "COMFY_BIN", "comfy").into(),
            comfy_workdir: lookup("COMFY_WORKDIR").map(PathBuf::from),
            workflow_dir,
            output_dir: string_or(&lookup, "OUTPUT_DIR", DEFAULT_OUTPUT_DIR).into(),
            engine_timeout: Duration::from_secs(parse_or(&lookup, "ENGINE_TIMEOUT_SECS", 1200)?),
            startup_grace: Duration::from_secs(parse_or(&lookup, "STARTUP_GRACE_SECS", 10)?),
            startup_deadline: Duration::from_secs(parse_or(&lookup, "STARTUP_DEADLINE_SECS", 60)?),
            probe_timeout: Duration::from_secs(parse_or(&lookup, "PROBE_TIMEOUT_SECS", 5)?),
            output_kinds,
            retention,
            runtime_links,
        })
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            startup_grace: self.startup_grace,
            startup_policy: BackoffPolicy::startup().with_deadline(self.startup_deadline),
            startup_probe_timeout: self.probe_timeout,
            request_policy: BackoffPolicy::single_attempt(),
            request_probe_timeout: self.probe_timeout,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            program: self.comfy_bin.clone(),
            workflow_dir: self.workflow_dir.clone(),
            output_dir: self.output_dir.clone(),
            engine_timeout: self.engine_timeout,
            retention: self.retention,
            ..ExecutorConfig::default()
        }
    }

    /// The HTTP deadline must outlast a full engine run including its kill
    /// grace, or clients get a 504 while the run still holds the engine.
    pub fn check_request_timeout(&self, server: &ServerConfig) -> Result<(), ConfigError> {
        let kill_grace = self.executor_config().kill_grace;
        let engine_budget = self.engine_timeout + kill_grace;
        if Duration::from_secs(server.request_timeout_secs) <= engine_budget {
            return Err(ConfigError {
                key: "REQUEST_TIMEOUT_SECS",
                value: server.request_timeout_secs.to_string(),
                reason: format!(
                    "must exceed ENGINE_TIMEOUT_SECS plus the {}s kill grace ({}s)",
                    kill_grace.as_secs(),
                    engine_budget.as_secs()
                ),
            });
        }
        Ok(())
    }

    fn launcher(&self) -> Option<EngineLauncher> {
        if !self.launch_engine {
            return None;
        }
        let mut launcher = EngineLauncher::comfy_cli(self.engine_port);
        launcher.program = self.comfy_bin.clone();
        if let Some(dir) = &self.comfy_workdir {
            launcher = launcher.with_working_dir(dir);
        }
        Some(launcher)
    }

    /// Assemble an unbooted worker talking to the local engine.
    pub fn build_worker(&self) -> Worker {
        let probe = Arc::new(HttpHealthProbe::new(EngineApi::local(self.engine_port)));
        let supervisor = Arc::new(Supervisor::new(
            probe,
            self.launcher(),
            self.supervisor_config(),
        ));
        Worker::new(
            supervisor,
            GraphPatcher::new(self.output_kinds.clone()),
            Executor::new(self.executor_config()),
        )
    }
}
