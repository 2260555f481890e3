//! Persisted provisioning requests.
//!
//! Every mutation after creation goes through [`ProvisionRequestStore::transition`],
//! which reads, merges and writes back under a single lock so log lines from
//! concurrent callers are never lost.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};
use crate::state_machine::{ProvisionRequest, RequestId, StateMachine, StatusUpdate, Transition};

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    requests: BTreeMap<RequestId, ProvisionRequest>,
}

/// Serializable contents of a [`ProvisionRequestStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub next_id: u64,
    pub requests: Vec<ProvisionRequest>,
}

#[derive(Debug, Default)]
pub struct ProvisionRequestStore {
    inner: RwLock<Inner>,
}

impl ProvisionRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new PENDING request and return its id.
    pub async fn create(
        &self,
        name: impl Into<String>,
        template: impl Into<String>,
        input: serde_json::Value,
    ) -> RequestId {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let id = RequestId(inner.next_id);
        let request = ProvisionRequest::new(id, name.into(), template.into(), input);
        info!(request_id = %id, template = %request.template, "request created");
        inner.requests.insert(id, request);
        id
    }

    /// Apply `update` to the request. Returns whether it was applied.
    ///
    /// A missing request is not an error: the workflow may race a delete.
    pub async fn transition(&self, id: RequestId, update: StatusUpdate) -> bool {
        let mut inner = self.inner.write().await;
        let Some(request) = inner.requests.get_mut(&id) else {
            debug!(request_id = %id, status = %update.status, "transition on missing request ignored");
            return false;
        };

        match StateMachine::apply(request, update) {
            Transition::Applied { from, to } => {
                debug!(request_id = %id, %from, %to, log_len = request.log.len(), "transition applied");
                true
            }
            Transition::Rejected { from, to, reason } => {
                warn!(request_id = %id, %from, %to, %reason, "transition rejected");
                false
            }
        }
    }

    pub async fn get(&self, id: RequestId) -> Option<ProvisionRequest> {
        self.inner.read().await.requests.get(&id).cloned()
    }

    /// All requests, newest first.
    pub async fn list(&self) -> Vec<ProvisionRequest> {
        self.inner
            .read()
            .await
            .requests
            .values()
            .rev()
            .cloned()
            .collect()
    }

    /// Remove the record. Releasing the request's slots is the caller's job.
    pub async fn delete(&self, id: RequestId) -> Result<ProvisionRequest> {
        let removed = self.inner.write().await.requests.remove(&id);
        match removed {
            Some(request) => {
                info!(request_id = %id, status = %request.status, "request deleted");
                Ok(request)
            }
            None => Err(ProvisionError::NotFound(id)),
        }
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.read().await;
        StoreSnapshot {
            next_id: inner.next_id,
            requests: inner.requests.values().cloned().collect(),
        }
    }

    /// Rebuild a store from a snapshot. Ids never go backwards.
    ///
    /// Fails when a request's resources or error disagree with its status.
    pub fn restore(snapshot: StoreSnapshot) -> Result<Self> {
        let mut requests = BTreeMap::new();
        for request in snapshot.requests {
            if !request.is_consistent() {
                return Err(ProvisionError::Config(format!(
                    "request {} is {} but resources/error do not match",
                    request.id, request.status
                )));
            }
            if requests.insert(request.id, request).is_some() {
                return Err(ProvisionError::Config("duplicate request id in state".into()));
            }
        }
        let highest = requests.keys().next_back().map_or(0, |id: &RequestId| id.0);
        Ok(Self {
            inner: RwLock::new(Inner {
                next_id: snapshot.next_id.max(highest),
                requests,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::state_machine::{RequestStatus, Resources};

    fn resources() -> Resources {
        Resources {
            primary_address: "10.99.0.4".into(),
            web_url: "https://crm.mock.example.com".into(),
            db_vip: "db-crm.vip.mock.local".into(),
            access_targets: vec![],
        }
    }

    #[tokio::test]
    async fn create_starts_pending() {
        let store = ProvisionRequestStore::new();
        let id = store.create("crm", "single", json!({"owner": "ops"})).await;
        let req = store.get(id).await.unwrap();
        assert_eq!(req.status, RequestStatus::Pending);
        assert_eq!(req.input["owner"], "ops");
        assert!(req.log.is_empty());
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let store = ProvisionRequestStore::new();
        let a = store.create("a", "single", json!({})).await;
        let b = store.create("b", "single", json!({})).await;
        let c = store.create("c", "single", json!({})).await;
        let ids: Vec<_> = store.list().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![c, b, a]);
    }

    #[tokio::test]
    async fn transition_appends_and_overwrites() {
        let store = ProvisionRequestStore::new();
        let id = store.create("crm", "single", json!({})).await;

        assert!(store.transition(id, StatusUpdate::running("one").with_assigned_address("")).await);
        assert!(store.transition(id, StatusUpdate::running("two")).await);
        assert!(store.transition(id, StatusUpdate::completed(resources())).await);

        let req = store.get(id).await.unwrap();
        assert_eq!(req.log, vec!["one", "two"]);
        assert_eq!(req.status, RequestStatus::Completed);
        assert_eq!(req.assigned_address, "10.99.0.4");
    }

    #[tokio::test]
    async fn transition_on_missing_request_is_noop() {
        let store = ProvisionRequestStore::new();
        assert!(!store.transition(RequestId(404), StatusUpdate::running("x")).await);
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn transition_after_terminal_is_ignored() {
        let store = ProvisionRequestStore::new();
        let id = store.create("crm", "single", json!({})).await;
        store.transition(id, StatusUpdate::running("one")).await;
        store.transition(id, StatusUpdate::failed("boom")).await;

        assert!(!store.transition(id, StatusUpdate::running("late")).await);
        let req = store.get(id).await.unwrap();
        assert_eq!(req.log, vec!["one", "Error: boom"]);
        assert_eq!(req.status, RequestStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_are_not_lost() {
        let store = Arc::new(ProvisionRequestStore::new());
        let id = store.create("crm", "single", json!({})).await;
        store.transition(id, StatusUpdate::running("start")).await;

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.transition(id, StatusUpdate::running(format!("line {i}"))).await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap());
        }

        assert_eq!(store.get(id).await.unwrap().log.len(), 33);
    }

    #[tokio::test]
    async fn delete_unknown_is_not_found() {
        let store = ProvisionRequestStore::new();
        let err = store.delete(RequestId(3)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotFound(RequestId(3))));
    }

    #[tokio::test]
    async fn restore_keeps_ids_monotonic() {
        let store = ProvisionRequestStore::new();
        store.create("a", "single", json!({})).await;
        let b = store.create("b", "single", json!({})).await;
        let mut snapshot = store.snapshot().await;
        snapshot.next_id = 0;

        let restored = ProvisionRequestStore::restore(snapshot).unwrap();
        let c = restored.create("c", "single", json!({})).await;
        assert!(c > b);
        assert_eq!(restored.list().await.len(), 3);
    }

    #[test]
    fn restore_rejects_completed_without_resources() {
        let mut done = ProvisionRequest::new(RequestId(1), "a".into(), "single".into(), json!({}));
        done.status = RequestStatus::Completed;
        let snapshot = StoreSnapshot {
            next_id: 1,
            requests: vec![done],
        };
        let err = ProvisionRequestStore::restore(snapshot).unwrap_err();
        assert!(matches!(err, ProvisionError::Config(_)));
    }
}
