#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use imagegen_comfyui::executor::{Executor, ExecutorConfig};
use imagegen_comfyui::health::{HealthProbe, ProbeError};
use imagegen_comfyui::supervisor::{Supervisor, SupervisorConfig};
use imagegen_comfyui::worker::Worker;
use imagegen_core::backoff::BackoffPolicy;
use imagegen_core::graph::{Node, NodeGraph, NodeRef};
use imagegen_core::patcher::GraphPatcher;
use serde_json::json;

/// Bytes the stub engine writes as its "image".
pub const STUB_IMAGE: &[u8] = b"\x89PNG stub image";

/// Health probe whose answer is switched by the test.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    healthy: AtomicBool,
    calls: AtomicU32,
}

impl ScriptedProbe {
    pub fn healthy() -> Arc<Self> {
        let probe = Self::default();
        probe.set_healthy(true);
        Arc::new(probe)
    }

    pub fn unhealthy() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, timeout: Duration) -> Result<(), ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProbeError::Timeout(timeout))
        }
    }
}

/// Supervisor timings short enough for tests: no grace period, at most
/// three readiness probes a few milliseconds apart.
pub fn fast_supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        startup_grace: Duration::ZERO,
        startup_policy: BackoffPolicy {
            initial_delay: Duration::from_millis(5),
            multiplier: 1.5,
            max_delay: Duration::from_millis(20),
            deadline: Some(Duration::from_secs(5)),
            max_attempts: Some(3),
        },
        startup_probe_timeout: Duration::from_millis(100),
        request_policy: BackoffPolicy::single_attempt(),
        request_probe_timeout: Duration::from_millis(100),
    }
}

/// Temporary layout for a stub engine run.
pub struct StubEngine {
    pub dir: tempfile::TempDir,
}

const STUB_SCRIPT: &str = r#"
workflow=""
while [ $# -gt 0 ]; do
    if [ "$1" = "--workflow" ]; then
        workflow="$2"
    fi
    shift
done
if ! mkdir "@BUSY@" 2>/dev/null; then
    echo overlap >> "@OVERLAPS@"
fi
echo invoked >> "@MARKER@"
sleep @DELAY@
rmdir "@BUSY@" 2>/dev/null
prefix=$(basename "$workflow" .json)
printf '\211PNG stub image' > "@OUTPUT@/${prefix}_00001_.png"
echo "Prompt executed"
"#;

impl StubEngine {
    /// Lay out `workflows/`, `output/` and a `sh` script that behaves like
    /// `comfy run`: it writes one output file named after the graph file.
    pub fn new() -> Self {
        Self::with_delay("0")
    }

    /// Like [`StubEngine::new`], but each run holds the engine for `secs`
    /// (a `sleep` argument) and records any run that starts while another
    /// is still busy.
    pub fn with_delay(secs: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("workflows")).unwrap();
        std::fs::create_dir_all(dir.path().join("output")).unwrap();

        let script = STUB_SCRIPT
            .replace("@MARKER@", &dir.path().join("invocations").display().to_string())
            .replace("@OUTPUT@", &dir.path().join("output").display().to_string())
            .replace("@BUSY@", &dir.path().join("busy").display().to_string())
            .replace("@OVERLAPS@", &dir.path().join("overlaps").display().to_string())
            .replace("@DELAY@", secs);
        std::fs::write(dir.path().join("engine.sh"), script).unwrap();

        Self { dir }
    }

    pub fn workflow_dir(&self) -> PathBuf {
        self.dir.path().join("workflows")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("output")
    }

    /// Number of times the stub was run.
    pub fn invocations(&self) -> usize {
        std::fs::read_to_string(self.dir.path().join("invocations"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    /// Runs that started while another run was in progress.
    pub fn overlaps(&self) -> usize {
        std::fs::read_to_string(self.dir.path().join("overlaps"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            program: PathBuf::from("sh"),
            leading_args: vec![self.dir.path().join("engine.sh").display().to_string()],
            workflow_dir: self.workflow_dir(),
            output_dir: self.output_dir(),
            engine_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(5),
            ..ExecutorConfig::default()
        }
    }
}

pub fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
}

/// A worker over `probe` and `engine`, not yet booted.
pub fn build_worker(probe: Arc<ScriptedProbe>, engine: &StubEngine) -> Worker {
    let supervisor = Arc::new(Supervisor::new(probe, None, fast_supervisor_config()));
    Worker::new(
        supervisor,
        GraphPatcher::default(),
        Executor::new(engine.executor_config()),
    )
}

/// Minimal text-to-image workflow with a `SaveImage` node at id "9".
pub fn sample_graph() -> NodeGraph {
    let mut graph = NodeGraph::new();
    graph.insert(
        "4",
        Node::new("CheckpointLoaderSimple").with_input("ckpt_name", json!("model.safetensors")),
    );
    graph.insert(
        "8",
        Node::new("VAEDecode")
            .with_input("samples", NodeRef::new("3", 0))
            .with_input("vae", NodeRef::new("4", 2)),
    );
    graph.insert(
        "9",
        Node::new("SaveImage")
            .with_input("filename_prefix", json!("ComfyUI"))
            .with_input("images", NodeRef::new("8", 0)),
    );
    graph
}
