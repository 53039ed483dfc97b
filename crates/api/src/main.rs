use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use imagegen_artifacts::provision::{ConsumerLayout, ProvisionMode, Provisioner};
use imagegen_core::artifact::ArtifactManifest;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use imagegen_api::config::{RuntimeLinks, ServerConfig, WorkerConfig};
use imagegen_api::router::build_app_router;
use imagegen_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imagegen_api=debug,imagegen_comfyui=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env()?;
    let worker_config = WorkerConfig::from_env()?;
    worker_config.check_request_timeout(&config)?;
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Model links ---
    if let Some(links) = worker_config.runtime_links.clone() {
        sync_links(links).await?;
    }

    // --- Shutdown signal ---
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    // --- Engine ---
    let worker = Arc::new(worker_config.build_worker());
    let supervisor = Arc::clone(worker.supervisor());
    if let Err(e) = supervisor.boot(&cancel).await {
        supervisor.shutdown().await;
        return Err(e).context("engine failed to start");
    }

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        worker: Arc::clone(&worker),
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let host = config
        .host
        .parse()
        .with_context(|| format!("invalid HOST address {:?}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    let stop_supervisor = Arc::clone(&supervisor);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = stop_supervisor.retired() => {
                    tracing::warn!("Worker retired, no longer accepting connections");
                }
            }
        })
        .await
        .context("server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, stopping engine");
    let retired = supervisor.state().is_terminal();
    supervisor.shutdown().await;

    if retired {
        // Non-zero exit so the platform replaces this worker.
        anyhow::bail!("worker retired after engine health failure");
    }
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Re-link cached models into the engine directories before it starts.
async fn sync_links(links: RuntimeLinks) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(&links.manifest)
        .await
        .with_context(|| format!("failed to read manifest {}", links.manifest.display()))?;
    let manifest = ArtifactManifest::from_json(&text)?;

    let layout = ConsumerLayout::comfyui(&links.comfy_root).with_overrides(&manifest.targets);
    let provisioner = Provisioner::new(links.cache_root, layout);
    let report = tokio::task::spawn_blocking(move || {
        provisioner.provision(&manifest.artifacts, ProvisionMode::Runtime)
    })
    .await??;

    if !report.is_success() {
        tracing::warn!(
            missing_source = ?report.missing_source,
            verify_failed = report.verify_failed.len(),
            "Some models are not linked, workflows using them will fail",
        );
    }
    Ok(())
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by the platform.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
