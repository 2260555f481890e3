//! Launches provisioning workflows as background tasks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::backend::ResourceBackend;
use crate::error::{ProvisionError, Result};
use crate::pool::Allocator;
use crate::state_machine::{ProvisionRequest, RequestId, RequestStatus};
use crate::store::ProvisionRequestStore;
use crate::workflow::{ProvisioningWorkflow, WorkflowOutcome};

/// Workflows still running. A finished workflow leaves its request terminal
/// (or deleted), which is what refuses a relaunch afterwards.
#[derive(Debug, Default)]
struct Registry {
    in_flight: HashMap<RequestId, CancellationToken>,
}

/// Handle to one spawned workflow. Dropping it detaches the task.
#[derive(Debug)]
pub struct WorkflowHandle {
    request_id: RequestId,
    run_id: Uuid,
    cancel: CancellationToken,
    join: JoinHandle<WorkflowOutcome>,
}

impl WorkflowHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Ask the workflow to stop at its next step boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the workflow to reach a terminal state.
    pub async fn wait(self) -> Result<WorkflowOutcome> {
        self.join
            .await
            .map_err(|e| ProvisionError::WorkflowFault(format!("workflow task failed: {e}")))
    }
}

/// Spawns at most one workflow per request and tears requests down.
pub struct WorkflowScheduler<B: ResourceBackend> {
    store: Arc<ProvisionRequestStore>,
    backend: Arc<B>,
    allocator: Allocator,
    workflow: ProvisioningWorkflow<B>,
    registry: Arc<Mutex<Registry>>,
}

impl<B: ResourceBackend> WorkflowScheduler<B> {
    pub fn new(
        store: Arc<ProvisionRequestStore>,
        backend: Arc<B>,
        allocator: Allocator,
        workflow: ProvisioningWorkflow<B>,
    ) -> Self {
        Self {
            store,
            backend,
            allocator,
            workflow,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Create a request and launch its workflow without waiting for it.
    pub async fn submit(
        &self,
        name: impl Into<String>,
        template: impl Into<String>,
        input: serde_json::Value,
    ) -> Result<WorkflowHandle> {
        let id = self.store.create(name, template, input).await;
        self.launch(id).await
    }

    /// Spawn the workflow for an existing request.
    ///
    /// Only a PENDING request with no running workflow can be launched;
    /// anything else fails with `AlreadyLaunched`.
    pub async fn launch(&self, id: RequestId) -> Result<WorkflowHandle> {
        let cancel = CancellationToken::new();
        {
            let mut registry = self.registry.lock().await;
            // Read under the registry lock so a workflow finishing meanwhile is seen as terminal.
            let Some(request) = self.store.get(id).await else {
                return Err(ProvisionError::NotFound(id));
            };
            if request.status != RequestStatus::Pending || registry.in_flight.contains_key(&id) {
                return Err(ProvisionError::AlreadyLaunched(id));
            }
            registry.in_flight.insert(id, cancel.clone());
        }

        let run_id = Uuid::new_v4();
        let span = info_span!("workflow", request_id = %id, %run_id);
        let workflow = self.workflow.clone();
        let registry = self.registry.clone();
        let token = cancel.clone();

        let join = tokio::spawn(
            async move {
                let outcome = workflow.run(id, token).await;
                registry.lock().await.in_flight.remove(&id);
                outcome
            }
            .instrument(span),
        );

        info!(request_id = %id, %run_id, "workflow launched");
        Ok(WorkflowHandle {
            request_id: id,
            run_id,
            cancel,
            join,
        })
    }

    /// Cancel the in-flight workflow of `id`, if any. Returns whether one was running.
    pub async fn cancel(&self, id: RequestId) -> bool {
        match self.registry.lock().await.in_flight.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.registry.lock().await.in_flight.len()
    }

    /// Stop any running workflow, release the request's slots, then delete it.
    ///
    /// Slots go first so a crash in between leaves them free, not leaked.
    pub async fn teardown(&self, id: RequestId) -> Result<ProvisionRequest> {
        if self.store.get(id).await.is_none() {
            return Err(ProvisionError::NotFound(id));
        }

        self.cancel(id).await;
        // Slots may predate the current backend (e.g. a state file written by a pool run).
        self.backend.release(id).await;
        self.allocator.release(id).await;
        let removed = self.store.delete(id).await?;

        self.registry.lock().await.in_flight.remove(&id);
        info!(request_id = %id, "request torn down");
        Ok(removed)
    }
}
