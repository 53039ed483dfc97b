//! Request-scoped execution of a patched graph on the engine.
//!
//! One execution is: write the graph to a uniquely named file, run the
//! engine's command-line client against it and block until it finishes,
//! then locate the output file by its filename prefix and read it back.
//! The health probe that precedes this is the caller's job (see
//! [`crate::worker::Worker`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use imagegen_core::patcher::PatchedGraph;
use tokio::process::Command;

use crate::process::{run_command, CommandError, CommandOutput};

/// Default ComfyUI output directory inside the worker image.
pub const DEFAULT_OUTPUT_DIR: &str = "/root/comfy/ComfyUI/output";

/// Timeout handed to `comfy run --timeout`.
pub const DEFAULT_ENGINE_TIMEOUT: Duration = Duration::from_secs(1200);

/// What happens to the output file once it has been read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputRetention {
    /// Leave it for the engine's own housekeeping.
    #[default]
    Keep,
    /// Delete it after a successful read.
    Remove,
}

/// Where the executor reads and writes, and how it invokes the engine.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Engine client program (`comfy`).
    pub program: PathBuf,
    /// Arguments placed before `--workflow` (`["run"]`).
    pub leading_args: Vec<String>,
    /// Directory receiving the per-request graph files.
    pub workflow_dir: PathBuf,
    /// Engine output directory scanned for results.
    pub output_dir: PathBuf,
    /// Timeout passed to the engine client.
    pub engine_timeout: Duration,
    /// Extra wall-clock time granted on top of `engine_timeout` before the
    /// client is killed.
    pub kill_grace: Duration,
    pub retention: OutputRetention,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("comfy"),
            leading_args: vec!["run".into()],
            workflow_dir: std::env::temp_dir(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            engine_timeout: DEFAULT_ENGINE_TIMEOUT,
            kill_grace: Duration::from_secs(30),
            retention: OutputRetention::Keep,
        }
    }
}

/// The produced output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Artifact {
    /// MIME type derived from the file extension.
    pub fn content_type(&self) -> &'static str {
        let ext = Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("jpg" | "jpeg") => "image/jpeg",
            Some("webp") => "image/webp",
            Some("gif") => "image/gif",
            _ => "image/png",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("failed to encode graph: {0}")]
    GraphEncode(#[from] serde_json::Error),

    #[error("failed to write graph file {}: {source}", path.display())]
    GraphWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start engine client {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine client did not finish within {0:?}")]
    Timeout(Duration),

    #[error("engine client failed with exit code {exit_code}: {}", tail(.stderr))]
    EngineExecution {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("no output file with prefix {prefix} in {}", dir.display())]
    OutputNotFound { prefix: String, dir: PathBuf },

    #[error("failed to read output {}: {source}", path.display())]
    OutputRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while waiting for engine client: {0}")]
    Wait(#[source] std::io::Error),
}

impl From<CommandError> for ExecutionError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Spawn { program, source } => Self::Spawn { program, source },
            CommandError::Wait(e) => Self::Wait(e),
            CommandError::Timeout(elapsed) => Self::Timeout(elapsed),
        }
    }
}

/// Last few lines of engine output, for error messages.
fn tail(s: &str) -> String {
    const LINES: usize = 20;
    let lines: Vec<&str> = s.trim_end().lines().collect();
    let start = lines.len().saturating_sub(LINES);
    lines[start..].join("\n")
}

/// A graph file on disk, removed when dropped.
#[derive(Debug)]
pub struct GraphFile {
    path: PathBuf,
}

impl GraphFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for GraphFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove graph file",
            ),
        }
    }
}

/// Runs patched graphs through the engine's command-line client.
#[derive(Debug, Clone)]
pub struct Executor {
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Serialize the graph to `workflow_dir/{prefix}.json`.
    pub async fn write_graph(&self, patched: &PatchedGraph) -> Result<GraphFile, ExecutionError> {
        let body = serde_json::to_vec_pretty(&patched.graph)?;
        let path = self
            .config
            .workflow_dir
            .join(format!("{}.json", patched.prefix()));

        // Guard first so a partial write is cleaned up too.
        let file = GraphFile { path };
        tokio::fs::write(&file.path, body)
            .await
            .map_err(|source| ExecutionError::GraphWrite {
                path: file.path.clone(),
                source,
            })?;
        tracing::debug!(path = %file.path.display(), "Wrote graph file");
        Ok(file)
    }

    /// Run the engine client on `graph_file` and wait for it to finish.
    pub async fn invoke(&self, graph_file: &GraphFile) -> Result<CommandOutput, ExecutionError> {
        let mut cmd = self.command(graph_file.path());
        let hard_timeout = self.config.engine_timeout + self.config.kill_grace;

        tracing::info!(workflow = %graph_file.path().display(), "Running engine client");
        let output = run_command(&mut cmd, hard_timeout).await?;
        tracing::debug!(
            exit_code = output.exit_code,
            duration_ms = output.duration.as_millis() as u64,
            stdout = %tail(&output.stdout),
            "Engine client finished",
        );

        if !output.success() {
            tracing::error!(
                exit_code = output.exit_code,
                stderr = %tail(&output.stderr),
                "Engine client failed",
            );
            return Err(ExecutionError::EngineExecution {
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Locate and read the output produced for `prefix`.
    ///
    /// When several files match, the lexicographically smallest name wins.
    pub async fn collect(&self, prefix: &str) -> Result<Artifact, ExecutionError> {
        let dir = &self.config.output_dir;
        let not_found = || ExecutionError::OutputNotFound {
            prefix: prefix.to_string(),
            dir: dir.clone(),
        };

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Cannot list output directory");
                return Err(not_found());
            }
        };

        let mut matches = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(prefix) {
                continue;
            }
            if entry.file_type().await.is_ok_and(|t| t.is_file()) {
                matches.push(name);
            }
        }
        matches.sort();

        let Some(filename) = matches.first().cloned() else {
            return Err(not_found());
        };
        if matches.len() > 1 {
            tracing::warn!(
                count = matches.len(),
                chosen = %filename,
                "Several output files match prefix",
            );
        }

        let path = dir.join(&filename);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| ExecutionError::OutputRead {
                path: path.clone(),
                source,
            })?;

        if self.config.retention == OutputRetention::Remove {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove output file");
            }
        }

        tracing::info!(filename = %filename, size = bytes.len(), "Collected output");
        Ok(Artifact { filename, bytes })
    }

    fn command(&self, workflow: &Path) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.leading_args)
            .arg("--workflow")
            .arg(workflow)
            .arg("--wait")
            .arg("--timeout")
            .arg(self.config.engine_timeout.as_secs().to_string())
            .arg("--verbose");
        cmd
    }
}
