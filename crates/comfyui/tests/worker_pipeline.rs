#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use imagegen_comfyui::executor::ExecutionError;
use imagegen_comfyui::launcher::EngineLauncher;
use imagegen_comfyui::supervisor::{Supervisor, SupervisorError, WorkerState};
use imagegen_comfyui::worker::WorkerError;
use imagegen_core::error::CoreError;
use imagegen_core::graph::{Node, NodeGraph};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{
    build_worker, dir_is_empty, fast_supervisor_config, sample_graph, ScriptedProbe, StubEngine,
    STUB_IMAGE,
};

#[tokio::test]
async fn generates_image_end_to_end() {
    let engine = StubEngine::new();
    let probe = ScriptedProbe::healthy();
    let worker = build_worker(probe.clone(), &engine);
    worker.supervisor().boot(&CancellationToken::new()).await.unwrap();
    assert_eq!(worker.state(), WorkerState::Ready);

    let artifact = worker.generate(&sample_graph()).await.unwrap();

    assert_eq!(artifact.bytes, STUB_IMAGE);
    assert_eq!(artifact.content_type(), "image/png");
    assert!(artifact.filename.ends_with("_00001_.png"));
    assert_eq!(engine.invocations(), 1);
    // Graph file removed, output kept.
    assert!(dir_is_empty(&engine.workflow_dir()));
    assert!(engine.output_dir().join(&artifact.filename).exists());
}

#[tokio::test]
async fn every_request_gets_a_fresh_prefix() {
    let engine = StubEngine::new();
    let worker = build_worker(ScriptedProbe::healthy(), &engine);
    worker.supervisor().boot(&CancellationToken::new()).await.unwrap();

    let first = worker.generate(&sample_graph()).await.unwrap();
    let second = worker.generate(&sample_graph()).await.unwrap();

    assert_ne!(first.filename, second.filename);
    assert_eq!(engine.invocations(), 2);
}

#[tokio::test]
async fn concurrent_requests_all_complete() {
    let engine = StubEngine::new();
    let worker = Arc::new(build_worker(ScriptedProbe::healthy(), &engine));
    worker.supervisor().boot(&CancellationToken::new()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let worker = Arc::clone(&worker);
        handles.push(tokio::spawn(async move { worker.generate(&sample_graph()).await }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().bytes, STUB_IMAGE);
    }
    assert_eq!(engine.invocations(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn engine_runs_never_overlap() {
    let engine = StubEngine::with_delay("0.2");
    let worker = Arc::new(build_worker(ScriptedProbe::healthy(), &engine));
    worker.supervisor().boot(&CancellationToken::new()).await.unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.generate(&sample_graph()).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(engine.invocations(), 4);
    assert_eq!(engine.overlaps(), 0, "two engine runs were in flight at once");
}

#[tokio::test]
async fn boot_fails_after_repeated_probe_failures() {
    let engine = StubEngine::new();
    let probe = ScriptedProbe::unhealthy();
    let worker = build_worker(probe.clone(), &engine);

    let err = worker
        .supervisor()
        .boot(&CancellationToken::new())
        .await
        .unwrap_err();

    assert_matches!(err, SupervisorError::BootTimeout { attempts: 3, .. });
    assert_eq!(probe.calls(), 3);
    assert_eq!(worker.state(), WorkerState::Retired);

    // A retired worker never reaches the engine.
    let err = worker.generate(&sample_graph()).await.unwrap_err();
    assert_matches!(err, WorkerError::Supervisor(SupervisorError::EngineUnhealthy { .. }));
    assert_eq!(engine.invocations(), 0);
}

#[tokio::test]
async fn failed_liveness_probe_retires_without_invoking_engine() {
    let engine = StubEngine::new();
    let probe = ScriptedProbe::healthy();
    let worker = build_worker(probe.clone(), &engine);
    worker.supervisor().boot(&CancellationToken::new()).await.unwrap();
    let mut states = worker.supervisor().subscribe();

    probe.set_healthy(false);
    let err = worker.generate(&sample_graph()).await.unwrap_err();

    assert_matches!(
        err,
        WorkerError::Supervisor(SupervisorError::EngineUnhealthy { state: WorkerState::Degraded, .. })
    );
    assert_eq!(engine.invocations(), 0);
    assert!(dir_is_empty(&engine.workflow_dir()));
    assert_eq!(worker.state(), WorkerState::Retired);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), WorkerState::Retired);

    // Later requests are rejected without probing again, even if the
    // engine would now answer.
    probe.set_healthy(true);
    let calls = probe.calls();
    assert!(worker.generate(&sample_graph()).await.is_err());
    assert_eq!(probe.calls(), calls);

    tokio::time::timeout(Duration::from_secs(1), worker.supervisor().retired())
        .await
        .expect("retired() should resolve");
}

#[tokio::test]
async fn queued_requests_fail_fast_once_worker_retires() {
    let engine = StubEngine::new();
    let probe = ScriptedProbe::healthy();
    let worker = Arc::new(build_worker(probe.clone(), &engine));
    worker.supervisor().boot(&CancellationToken::new()).await.unwrap();
    let calls = probe.calls();

    probe.set_healthy(false);
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.generate(&sample_graph()).await })
        })
        .collect();
    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert_matches!(err, WorkerError::Supervisor(SupervisorError::EngineUnhealthy { .. }));
    }

    // Only the request holding the slot probed the engine.
    assert_eq!(probe.calls(), calls + 1);
    assert_eq!(engine.invocations(), 0);
    assert_eq!(worker.state(), WorkerState::Retired);
}

#[tokio::test]
async fn graph_without_output_node_is_rejected_before_probing() {
    let engine = StubEngine::new();
    let probe = ScriptedProbe::healthy();
    let worker = build_worker(probe.clone(), &engine);
    worker.supervisor().boot(&CancellationToken::new()).await.unwrap();
    let calls = probe.calls();

    let mut graph = NodeGraph::new();
    graph.insert("1", Node::new("PreviewImage").with_input("images", json!(["8", 0])));
    let err = worker.generate(&graph).await.unwrap_err();

    assert_matches!(err, WorkerError::Patch(CoreError::NoOutputNode { .. }));
    assert_eq!(probe.calls(), calls);
    assert_eq!(engine.invocations(), 0);
    assert_eq!(worker.state(), WorkerState::Ready);
}

#[tokio::test]
async fn engine_without_output_reports_output_not_found() {
    let engine = StubEngine::new();
    let mut config = engine.executor_config();
    config.leading_args = vec!["-c".into(), "exit 0".into(), "sh".into()];
    let supervisor = Arc::new(Supervisor::new(
        ScriptedProbe::healthy(),
        None,
        fast_supervisor_config(),
    ));
    let worker = imagegen_comfyui::worker::Worker::new(
        supervisor,
        Default::default(),
        imagegen_comfyui::executor::Executor::new(config),
    );
    worker.supervisor().boot(&CancellationToken::new()).await.unwrap();

    let err = worker.generate(&sample_graph()).await.unwrap_err();

    assert_matches!(err, WorkerError::Execution(ExecutionError::OutputNotFound { .. }));
    assert!(dir_is_empty(&engine.workflow_dir()));
    // An execution failure is not a health failure.
    assert_eq!(worker.state(), WorkerState::Ready);
}

#[tokio::test]
async fn launcher_failure_fails_boot() {
    let launcher = EngineLauncher::new("sh", vec!["-c".into(), "exit 2".into()]);
    let mut config = fast_supervisor_config();
    // Long enough for the launcher to exit before the first probe.
    config.startup_grace = Duration::from_millis(300);
    let probe = ScriptedProbe::unhealthy();
    let supervisor = Supervisor::new(probe.clone(), Some(launcher), config);

    let err = supervisor.boot(&CancellationToken::new()).await.unwrap_err();

    assert_matches!(err, SupervisorError::LauncherExited { code: Some(2) });
    assert_eq!(probe.calls(), 0);
    assert_eq!(supervisor.state(), WorkerState::Retired);
}

#[tokio::test]
async fn daemonising_launcher_then_healthy_engine_boots() {
    let launcher = EngineLauncher::new("sh", vec!["-c".into(), "exit 0".into()]);
    let supervisor = Supervisor::new(ScriptedProbe::healthy(), Some(launcher), fast_supervisor_config());

    supervisor.boot(&CancellationToken::new()).await.unwrap();

    assert_eq!(supervisor.state(), WorkerState::Ready);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn cancelled_boot_retires_worker() {
    let mut config = fast_supervisor_config();
    config.startup_grace = Duration::from_secs(30);
    let supervisor = Supervisor::new(ScriptedProbe::healthy(), None, config);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = supervisor.boot(&cancel).await.unwrap_err();

    assert_matches!(err, SupervisorError::Cancelled);
    assert_eq!(supervisor.state(), WorkerState::Retired);
}

#[tokio::test]
async fn boot_runs_only_once() {
    let supervisor = Supervisor::new(ScriptedProbe::healthy(), None, fast_supervisor_config());
    supervisor.boot(&CancellationToken::new()).await.unwrap();

    let err = supervisor.boot(&CancellationToken::new()).await.unwrap_err();
    assert_matches!(err, SupervisorError::AlreadyStarted(WorkerState::Ready));
}
