//! Engine process launch.
//!
//! The engine is started exactly once per worker. Two launch styles are
//! supported by the same code path: a launcher that stays in the foreground
//! as the engine process (`python main.py --port 8188`), and a launcher that
//! daemonises the engine and exits 0 (`comfy launch --background`). A
//! launcher that exits non-zero means the engine never started.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};

/// Default ComfyUI port.
pub const DEFAULT_ENGINE_PORT: u16 = 8188;

/// How to start the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLauncher {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl EngineLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
        }
    }

    /// `comfy launch --background -- --port <port>`.
    pub fn comfy_cli(port: u16) -> Self {
        Self::new(
            "comfy",
            vec![
                "launch".into(),
                "--background".into(),
                "--".into(),
                "--port".into(),
                port.to_string(),
            ],
        )
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Spawn the launcher.
    pub fn spawn(&self) -> Result<EngineProcess, LaunchError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|source| LaunchError {
            program: self.program.display().to_string(),
            source,
        })?;

        tracing::info!(
            program = %self.program.display(),
            args = ?self.args,
            pid = child.id(),
            "Engine launcher started",
        );

        Ok(EngineProcess { child })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to launch engine ({program}): {source}")]
pub struct LaunchError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

/// Handle to the launched engine (or its launcher).
#[derive(Debug)]
pub struct EngineProcess {
    child: Child,
}

impl EngineProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the process has already exited.
    pub fn try_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Kill the process if it is still running.
    pub async fn kill(&mut self) {
        if self.try_status().is_none() {
            if let Err(e) = self.child.kill().await {
                tracing::warn!(error = %e, "Failed to kill engine process");
            }
        }
    }
}
