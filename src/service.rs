//! Operations offered to outer layers (HTTP handlers, the CLI).
//!
//! [`Provisioner`] wires the request store, the slot pool, a
//! [`ResourceBackend`] and the [`WorkflowScheduler`] together. All handles
//! are injected at construction; nothing here is global.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::backend::ResourceBackend;
use crate::config::{ProvisionerConfig, TemplateCatalog};
use crate::error::{ProvisionError, Result};
use crate::persist::StateFile;
use crate::pool::{Allocator, ResourceSlot};
use crate::scheduler::{WorkflowHandle, WorkflowScheduler};
use crate::state_machine::{ProvisionRequest, RequestId, StatusUpdate};
use crate::store::ProvisionRequestStore;
use crate::workflow::ProvisioningWorkflow;

const INTERRUPTED: &str = "interrupted before completion";

pub struct Provisioner<B: ResourceBackend> {
    config: ProvisionerConfig,
    store: Arc<ProvisionRequestStore>,
    allocator: Allocator,
    backend: Arc<B>,
    scheduler: WorkflowScheduler<B>,
}

impl<B: ResourceBackend> Provisioner<B> {
    pub fn new(
        config: ProvisionerConfig,
        store: Arc<ProvisionRequestStore>,
        allocator: Allocator,
        backend: Arc<B>,
    ) -> Self {
        let workflow = ProvisioningWorkflow::new(store.clone(), backend.clone(), &config.workflow);
        let scheduler =
            WorkflowScheduler::new(store.clone(), backend.clone(), allocator.clone(), workflow);
        Self {
            config,
            store,
            allocator,
            backend,
            scheduler,
        }
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    pub fn templates(&self) -> &TemplateCatalog {
        &self.config.templates
    }

    /// Accept a request and start provisioning it in the background.
    ///
    /// A capacity shortfall known up front is rejected here; one that only
    /// shows up later ends the request FAILED instead.
    pub async fn submit_request(
        &self,
        name: &str,
        template: &str,
        input: serde_json::Value,
    ) -> Result<RequestId> {
        Ok(self.submit_tracked(name, template, input).await?.request_id())
    }

    /// Like [`submit_request`](Self::submit_request) but hands back the workflow handle.
    pub async fn submit_tracked(
        &self,
        name: &str,
        template: &str,
        input: serde_json::Value,
    ) -> Result<WorkflowHandle> {
        self.backend.check_capacity(template).await?;
        let handle = self.scheduler.submit(name, template, input).await?;
        info!(request_id = %handle.request_id(), template, "request accepted");
        Ok(handle)
    }

    pub async fn get_request(&self, id: RequestId) -> Result<ProvisionRequest> {
        self.store.get(id).await.ok_or(ProvisionError::NotFound(id))
    }

    /// Every request, newest first.
    pub async fn list_requests(&self) -> Vec<ProvisionRequest> {
        self.store.list().await
    }

    /// Release the request's slots, then remove it.
    pub async fn delete_request(&self, id: RequestId) -> Result<()> {
        self.scheduler.teardown(id).await.map(|_| ())
    }

    pub async fn cancel_request(&self, id: RequestId) -> bool {
        self.scheduler.cancel(id).await
    }

    /// Poll until the request reaches COMPLETED or FAILED.
    pub async fn wait_for_terminal(&self, id: RequestId, poll: Duration) -> Result<ProvisionRequest> {
        loop {
            let request = self.get_request(id).await?;
            if request.is_terminal() {
                return Ok(request);
            }
            sleep(poll).await;
        }
    }

    pub async fn pool_slots(&self) -> Vec<ResourceSlot> {
        self.allocator.pool().slots().await
    }

    /// Fail requests a previous process left PENDING or RUNNING and free their slots.
    pub async fn recover_interrupted(&self) -> Vec<RequestId> {
        let mut recovered = Vec::new();
        for request in self.store.list().await {
            if request.is_terminal() {
                continue;
            }
            self.backend.release(request.id).await;
            self.allocator.release(request.id).await;
            if self.store.transition(request.id, StatusUpdate::failed(INTERRUPTED)).await {
                warn!(request_id = %request.id, status = %request.status, "recovered interrupted request");
                recovered.push(request.id);
            }
        }
        recovered
    }

    pub async fn snapshot(&self) -> StateFile {
        StateFile {
            store: self.store.snapshot().await,
            slots: self.pool_slots().await,
        }
    }

    pub async fn save_state(&self, path: &Path) -> Result<()> {
        self.snapshot().await.save(path)
    }
}
