//! The request-handling entry point of a worker.

use std::sync::Arc;

use imagegen_core::error::CoreError;
use imagegen_core::graph::NodeGraph;
use imagegen_core::patcher::GraphPatcher;

use crate::executor::{Artifact, ExecutionError, Executor};
use crate::serializer::RequestSerializer;
use crate::supervisor::{Supervisor, SupervisorError, WorkerState};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Patch(#[from] CoreError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Everything one worker needs to turn a submitted graph into an image.
pub struct Worker {
    supervisor: Arc<Supervisor>,
    patcher: GraphPatcher,
    executor: Executor,
    serializer: RequestSerializer,
}

impl Worker {
    pub fn new(supervisor: Arc<Supervisor>, patcher: GraphPatcher, executor: Executor) -> Self {
        Self {
            supervisor,
            patcher,
            executor,
            serializer: RequestSerializer::new(),
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn state(&self) -> WorkerState {
        self.supervisor.state()
    }

    /// Run `graph` on the engine and return the produced image.
    ///
    /// The engine slot is held for the liveness probe and the engine run.
    /// Reading the output happens after the slot is released. Once the
    /// worker retires, requests still waiting for the slot fail without
    /// touching the engine.
    pub async fn generate(&self, graph: &NodeGraph) -> Result<Artifact, WorkerError> {
        let patched = self.patcher.patch(graph)?;
        let prefix = patched.prefix().to_string();

        for link in graph.links() {
            tracing::debug!(
                node_id = link.node_id,
                input = link.input,
                target = %link.target,
                "Workflow link",
            );
        }

        {
            let Some(_slot) = self.serializer.acquire().await else {
                let state = self.state();
                return Err(SupervisorError::EngineUnhealthy {
                    state,
                    reason: format!("worker is {state}, request dropped from queue"),
                }
                .into());
            };
            tracing::info!(prefix = %prefix, queued = self.serializer.queue_depth(), "Acquired engine slot");

            if let Err(e) = self.supervisor.ensure_healthy().await {
                if self.state().is_terminal() {
                    // Nothing queued behind us can run any more.
                    self.serializer.close();
                }
                return Err(e.into());
            }
            let graph_file = self.executor.write_graph(&patched).await?;
            self.executor.invoke(&graph_file).await?;
        }

        let artifact = self.executor.collect(&prefix).await?;
        tracing::info!(
            prefix = %prefix,
            filename = %artifact.filename,
            size = artifact.bytes.len(),
            "Generation complete",
        );
        Ok(artifact)
    }
}
