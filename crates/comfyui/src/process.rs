//! Bounded subprocess execution with captured output.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Maximum stdout or stderr size captured per stream (4 MiB).
///
/// The engine's `--verbose` output can be large; anything past this limit
/// is read and discarded so the child never blocks or dies on a closed pipe.
const MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code (`-1` if killed by signal).
    pub exit_code: i32,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while waiting for process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("process timed out after {0:?}")]
    Timeout(Duration),
}

/// Spawn `cmd`, capture stdout/stderr, and enforce `timeout`.
///
/// Stdin is closed. The child is killed if the timeout fires or if the
/// returned future is dropped.
pub async fn run_command(cmd: &mut Command, timeout: Duration) -> Result<CommandOutput, CommandError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let start = Instant::now();

    let mut child = cmd
        .spawn()
        .map_err(|source| CommandError::Spawn { program, source })?;

    // Drain the pipes in their own tasks so a chatty child cannot block on a
    // full pipe while we wait for it.
    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let stdout_bytes = stdout_task.await.unwrap_or_default();
            let stderr_bytes = stderr_task.await.unwrap_or_default();
            Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
                stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
                exit_code: status.code().unwrap_or(-1),
                duration: start.elapsed(),
            })
        }
        Ok(Err(e)) => Err(CommandError::Wait(e)),
        Err(_elapsed) => {
            // `kill_on_drop` only fires on drop; kill eagerly and reap.
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            Err(CommandError::Timeout(start.elapsed()))
        }
    }
}

/// Drain an output stream to EOF, keeping the first [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(mut h) = handle else {
        return buf;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match h.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_OUTPUT_BYTES - buf.len();
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    buf
}
