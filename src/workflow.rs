use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::ResourceBackend;
use crate::config::WorkflowConfig;
use crate::error::{ProvisionError, Result};
use crate::state_machine::{RequestId, StatusUpdate};
use crate::store::ProvisionRequestStore;

/// How a workflow run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    Completed,
    Failed(String),
    /// The request was deleted while the workflow was running.
    Vanished,
}

/// Drives one request from PENDING to COMPLETED or FAILED.
pub struct ProvisioningWorkflow<B: ResourceBackend> {
    store: Arc<ProvisionRequestStore>,
    backend: Arc<B>,
    steps: Vec<String>,
    step_delay: Duration,
}

impl<B: ResourceBackend> Clone for ProvisioningWorkflow<B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            backend: self.backend.clone(),
            steps: self.steps.clone(),
            step_delay: self.step_delay,
        }
    }
}

impl<B: ResourceBackend> ProvisioningWorkflow<B> {
    pub fn new(store: Arc<ProvisionRequestStore>, backend: Arc<B>, config: &WorkflowConfig) -> Self {
        Self {
            store,
            backend,
            steps: config.steps.clone(),
            step_delay: config.step_delay(),
        }
    }

    /// Run the workflow to a terminal state.
    ///
    /// Errors and panics raised while driving the steps never escape: they
    /// release whatever the backend reserved and end the request FAILED.
    pub async fn run(&self, id: RequestId, cancel: CancellationToken) -> WorkflowOutcome {
        let driven = AssertUnwindSafe(self.drive(id, &cancel)).catch_unwind().await;

        let message = match driven {
            Ok(Ok(outcome)) => return outcome,
            Ok(Err(err)) => err.failure_message(),
            Err(panic) => format!("workflow panicked: {}", panic_message(panic.as_ref())),
        };

        self.fail(id, message).await
    }

    async fn drive(&self, id: RequestId, cancel: &CancellationToken) -> Result<WorkflowOutcome> {
        let Some((first, rest)) = self.steps.split_first() else {
            return Err(ProvisionError::WorkflowFault("no workflow steps configured".into()));
        };

        let first = StatusUpdate::running(first.clone()).with_assigned_address("");
        if !self.step(id, first, cancel).await? {
            return Ok(WorkflowOutcome::Vanished);
        }
        for message in rest {
            if !self.step(id, StatusUpdate::running(message.clone()), cancel).await? {
                return Ok(WorkflowOutcome::Vanished);
            }
        }

        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        let Some(request) = self.store.get(id).await else {
            return Ok(WorkflowOutcome::Vanished);
        };

        let resources = self.backend.provision(&request).await?;
        // A teardown may have released before the claim landed.
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        let address_count = resources.access_targets.len();

        if self.store.transition(id, StatusUpdate::completed(resources)).await {
            info!(request_id = %id, addresses = address_count, "provisioning completed");
            Ok(WorkflowOutcome::Completed)
        } else {
            // Deleted between provisioning and completion; nobody owns the slots now.
            warn!(request_id = %id, "request vanished after provisioning, releasing");
            self.backend.release(id).await;
            Ok(WorkflowOutcome::Vanished)
        }
    }

    /// Write one step, then wait out the delay. Returns false when the
    /// request no longer accepts updates.
    async fn step(&self, id: RequestId, update: StatusUpdate, cancel: &CancellationToken) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        if !self.store.transition(id, update).await {
            return Ok(false);
        }
        debug!(request_id = %id, delay_ms = self.step_delay.as_millis() as u64, "step written");

        tokio::select! {
            _ = cancel.cancelled() => Err(ProvisionError::Cancelled),
            _ = sleep(self.step_delay) => Ok(true),
        }
    }

    async fn fail(&self, id: RequestId, message: String) -> WorkflowOutcome {
        self.backend.release(id).await;
        if self.store.transition(id, StatusUpdate::failed(message.clone())).await {
            error!(request_id = %id, %message, "provisioning failed");
            WorkflowOutcome::Failed(message)
        } else {
            WorkflowOutcome::Vanished
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::backend::{MockBackend, PoolBackend};
    use crate::config::{MockConfig, PoolConfig, TemplateCatalog};
    use crate::pool::{Allocator, ResourcePool};
    use crate::state_machine::{ProvisionRequest, RequestStatus, Resources};

    fn fast_config() -> WorkflowConfig {
        WorkflowConfig {
            step_delay_ms: 1,
            ..Default::default()
        }
    }

    fn mock_workflow(store: Arc<ProvisionRequestStore>) -> ProvisioningWorkflow<MockBackend> {
        let backend = Arc::new(MockBackend::new(MockConfig::default(), TemplateCatalog::default()));
        ProvisioningWorkflow::new(store, backend, &fast_config())
    }

    /// Backend that fails or panics on provision and counts releases.
    struct FaultyBackend {
        panic: bool,
        releases: AtomicUsize,
    }

    impl FaultyBackend {
        fn new(panic: bool) -> Self {
            Self {
                panic,
                releases: AtomicUsize::new(0),
            }
        }
    }

    impl ResourceBackend for FaultyBackend {
        async fn check_capacity(&self, _template: &str) -> Result<()> {
            Ok(())
        }

        async fn provision(&self, _request: &ProvisionRequest) -> Result<Resources> {
            if self.panic {
                panic!("driver crashed");
            }
            Err(ProvisionError::WorkflowFault("vcenter unreachable".into()))
        }

        async fn release(&self, _request_id: RequestId) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Claims real slots, then deletes the record before handing them back.
    struct DeletingBackend {
        store: Arc<ProvisionRequestStore>,
        inner: PoolBackend,
        releases: AtomicUsize,
    }

    impl ResourceBackend for DeletingBackend {
        async fn check_capacity(&self, template: &str) -> Result<()> {
            self.inner.check_capacity(template).await
        }

        async fn provision(&self, request: &ProvisionRequest) -> Result<Resources> {
            let resources = self.inner.provision(request).await?;
            self.store.delete(request.id).await?;
            Ok(resources)
        }

        async fn release(&self, request_id: RequestId) {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.inner.release(request_id).await;
        }
    }

    #[tokio::test]
    async fn delete_after_provision_releases_slots() {
        let store = Arc::new(ProvisionRequestStore::new());
        let pool = Arc::new(ResourcePool::new(PoolConfig::default().seed_slots()));
        let allocator = Allocator::new(pool.clone(), TemplateCatalog::default());
        let backend = Arc::new(DeletingBackend {
            store: store.clone(),
            inner: PoolBackend::new(allocator, MockConfig::default(), Some("admin".into())),
            releases: AtomicUsize::new(0),
        });
        let workflow = ProvisioningWorkflow::new(store.clone(), backend.clone(), &fast_config());
        let id = store.create("crm", "standard", json!({})).await;

        let outcome = workflow.run(id, CancellationToken::new()).await;
        assert_eq!(outcome, WorkflowOutcome::Vanished);
        assert_eq!(backend.releases.load(Ordering::SeqCst), 1);
        assert!(store.get(id).await.is_none());
        assert_eq!(pool.available().await, 5);
        assert!(pool.owned_by(id).await.is_empty());
    }

    #[tokio::test]
    async fn workflow_happy_path() {
        let store = Arc::new(ProvisionRequestStore::new());
        let id = store.create("Shop Front", "standard", json!({})).await;

        let outcome = mock_workflow(store.clone()).run(id, CancellationToken::new()).await;
        assert_eq!(outcome, WorkflowOutcome::Completed);

        let req = store.get(id).await.unwrap();
        assert_eq!(req.status, RequestStatus::Completed);
        assert_eq!(req.log, fast_config().steps);
        let resources = req.resources.unwrap();
        assert_eq!(resources.access_targets.len(), 3);
        assert_eq!(req.assigned_address, resources.primary_address);
        assert!(req.error.is_none());
    }

    #[tokio::test]
    async fn backend_error_becomes_failed() {
        let store = Arc::new(ProvisionRequestStore::new());
        let id = store.create("crm", "single", json!({})).await;
        let backend = Arc::new(FaultyBackend::new(false));
        let workflow = ProvisioningWorkflow::new(store.clone(), backend.clone(), &fast_config());

        let outcome = workflow.run(id, CancellationToken::new()).await;
        assert_eq!(outcome, WorkflowOutcome::Failed("vcenter unreachable".into()));

        let req = store.get(id).await.unwrap();
        assert_eq!(req.status, RequestStatus::Failed);
        assert_eq!(req.log.len(), 7);
        assert_eq!(req.log.last().unwrap(), "Error: vcenter unreachable");
        assert!(req.resources.is_none());
        assert!(req.assigned_address.is_empty());
        assert_eq!(backend.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backend_panic_becomes_failed() {
        let store = Arc::new(ProvisionRequestStore::new());
        let id = store.create("crm", "single", json!({})).await;
        let backend = Arc::new(FaultyBackend::new(true));
        let workflow = ProvisioningWorkflow::new(store.clone(), backend, &fast_config());

        let outcome = workflow.run(id, CancellationToken::new()).await;
        assert!(matches!(outcome, WorkflowOutcome::Failed(ref m) if m.contains("driver crashed")));
        let req = store.get(id).await.unwrap();
        assert_eq!(req.status, RequestStatus::Failed);
        assert!(req.is_consistent());
    }

    #[tokio::test]
    async fn cancellation_stops_at_step_boundary() {
        let store = Arc::new(ProvisionRequestStore::new());
        let id = store.create("crm", "single", json!({})).await;
        let workflow = ProvisioningWorkflow::new(
            store.clone(),
            Arc::new(MockBackend::new(MockConfig::default(), TemplateCatalog::default())),
            &WorkflowConfig {
                step_delay_ms: 60_000,
                ..Default::default()
            },
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let workflow = workflow.clone();
            let cancel = cancel.clone();
            async move { workflow.run(id, cancel).await }
        });
        cancel.cancel();

        assert_eq!(task.await.unwrap(), WorkflowOutcome::Failed("cancelled".into()));
        let req = store.get(id).await.unwrap();
        assert_eq!(req.status, RequestStatus::Failed);
        assert_eq!(req.error.unwrap().message, "cancelled");
    }

    #[tokio::test]
    async fn deleted_request_vanishes_quietly() {
        let store = Arc::new(ProvisionRequestStore::new());
        let id = store.create("crm", "single", json!({})).await;
        store.delete(id).await.unwrap();

        let outcome = mock_workflow(store.clone()).run(id, CancellationToken::new()).await;
        assert_eq!(outcome, WorkflowOutcome::Vanished);
        assert!(store.get(id).await.is_none());
    }

    #[tokio::test]
    async fn empty_step_list_fails() {
        let store = Arc::new(ProvisionRequestStore::new());
        let id = store.create("crm", "single", json!({})).await;
        let workflow = ProvisioningWorkflow::new(
            store.clone(),
            Arc::new(MockBackend::new(MockConfig::default(), TemplateCatalog::default())),
            &WorkflowConfig {
                steps: vec![],
                step_delay_ms: 1,
            },
        );

        let outcome = workflow.run(id, CancellationToken::new()).await;
        assert_eq!(outcome, WorkflowOutcome::Failed("no workflow steps configured".into()));
        // PENDING → FAILED is a legal edge.
        assert_eq!(store.get(id).await.unwrap().status, RequestStatus::Failed);
    }
}
