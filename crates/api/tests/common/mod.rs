#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use imagegen_api::config::ServerConfig;
use imagegen_api::router::build_app_router;
use imagegen_api::state::AppState;
use imagegen_comfyui::executor::{Executor, ExecutorConfig};
use imagegen_comfyui::health::{HealthProbe, ProbeError};
use imagegen_comfyui::supervisor::{Supervisor, SupervisorConfig};
use imagegen_comfyui::worker::Worker;
use imagegen_core::backoff::BackoffPolicy;
use imagegen_core::patcher::GraphPatcher;

/// Bytes the stub engine writes as its output image.
pub const STUB_IMAGE: &[u8] = b"stub-image-bytes";

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        request_timeout_secs: 30,
        max_concurrent_requests: 5,
    }
}

/// Probe whose answer the test flips.
#[derive(Debug)]
pub struct SwitchProbe(AtomicBool);

impl SwitchProbe {
    pub fn set_healthy(&self, healthy: bool) {
        self.0.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthProbe for SwitchProbe {
    async fn probe(&self, timeout: Duration) -> Result<(), ProbeError> {
        if self.0.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProbeError::Timeout(timeout))
        }
    }
}

/// A worker backed by a `sh` stub engine, plus the handles tests poke at.
pub struct TestWorker {
    pub worker: Arc<Worker>,
    pub probe: Arc<SwitchProbe>,
    pub dir: tempfile::TempDir,
}

impl TestWorker {
    /// Unbooted worker whose engine writes [`STUB_IMAGE`] for every run.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workflows = dir.path().join("workflows");
        let output = dir.path().join("output");
        std::fs::create_dir_all(&workflows).unwrap();
        std::fs::create_dir_all(&output).unwrap();

        // Behaves like `comfy run --workflow <file> ...`: one output named
        // after the graph file.
        let script = format!(
            r#"for arg; do
    if [ "$prev" = "--workflow" ]; then workflow="$arg"; fi
    prev="$arg"
done
prefix=$(basename "$workflow" .json)
printf 'stub-image-bytes' > "{}/${{prefix}}_00001_.png""#,
            output.display()
        );

        let probe = Arc::new(SwitchProbe(AtomicBool::new(true)));
        let supervisor = Arc::new(Supervisor::new(
            probe.clone(),
            None,
            SupervisorConfig {
                startup_grace: Duration::ZERO,
                startup_policy: BackoffPolicy::startup().with_max_attempts(1),
                startup_probe_timeout: Duration::from_millis(100),
                request_policy: BackoffPolicy::single_attempt(),
                request_probe_timeout: Duration::from_millis(100),
            },
        ));
        let executor = Executor::new(ExecutorConfig {
            program: PathBuf::from("sh"),
            leading_args: vec!["-c".into(), script, "sh".into()],
            workflow_dir: workflows,
            output_dir: output,
            engine_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(5),
            ..ExecutorConfig::default()
        });

        Self {
            worker: Arc::new(Worker::new(supervisor, GraphPatcher::default(), executor)),
            probe,
            dir,
        }
    }

    /// Booted worker, ready for requests.
    pub async fn ready() -> Self {
        let this = Self::new();
        this.worker
            .supervisor()
            .boot(&CancellationToken::new())
            .await
            .unwrap();
        this
    }

    /// The full application router, as built by `main.rs`.
    pub fn app(&self) -> Router {
        let config = test_config();
        let state = AppState {
            config: Arc::new(config.clone()),
            worker: Arc::clone(&self.worker),
        };
        build_app_router(state, &config)
    }
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_text(response: Response<Body>) -> String {
    String::from_utf8(body_bytes(response).await).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Text-to-image workflow with a `SaveImage` node whose `images` input is
/// wrapped one level too deep, as some clients send it.
pub const WORKFLOW: &str = r#"{
    "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "model.safetensors"}},
    "8": {"class_type": "VAEDecode", "inputs": {"samples": ["3", 0], "vae": ["4", 2]}},
    "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "ComfyUI", "images": [["8", 0]]},
          "_meta": {"title": "Save Image"}}
}"#;
