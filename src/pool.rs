//! Slot pool and the allocator that claims batches out of it.
//!
//! A [`ResourcePool`] holds pre-seeded [`ResourceSlot`]s behind one async
//! mutex. The [`Allocator`] is the only writer: `claim` selects and marks a
//! batch while holding the lock, so two concurrent claims can never observe
//! the same free slot.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::TemplateCatalog;
use crate::error::{ProvisionError, Result};
use crate::state_machine::RequestId;

/// Stable identity of a slot; allocation order follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One allocatable VM-like unit.
///
/// `in_use` is false exactly when `request_id` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSlot {
    pub id: SlotId,
    pub name: String,
    pub address: String,
    pub in_use: bool,
    pub request_id: Option<RequestId>,
    pub owner_tag: Option<String>,
}

impl ResourceSlot {
    pub fn free(id: SlotId, name: String, address: String) -> Self {
        Self {
            id,
            name,
            address,
            in_use: false,
            request_id: None,
            owner_tag: None,
        }
    }

    /// A slot is in use exactly when it names its owning request.
    pub fn is_consistent(&self) -> bool {
        self.in_use == self.request_id.is_some()
    }

    fn occupy(&mut self, request_id: RequestId, owner_tag: Option<&str>) {
        self.in_use = true;
        self.request_id = Some(request_id);
        self.owner_tag = owner_tag.map(str::to_string);
    }

    fn vacate(&mut self) {
        self.in_use = false;
        self.request_id = None;
        self.owner_tag = None;
    }
}

/// Persisted collection of slots.
#[derive(Debug, Default)]
pub struct ResourcePool {
    slots: Mutex<BTreeMap<SlotId, ResourceSlot>>,
}

impl ResourcePool {
    pub fn new(slots: impl IntoIterator<Item = ResourceSlot>) -> Self {
        let slots = slots.into_iter().map(|slot| (slot.id, slot)).collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Rebuild a pool from persisted slots, refusing shapes `release` could never undo.
    pub fn restore(slots: Vec<ResourceSlot>) -> Result<Self> {
        let mut restored = BTreeMap::new();
        for slot in slots {
            if !slot.is_consistent() {
                return Err(ProvisionError::Config(format!(
                    "slot {} has in_use={} but request_id={:?}",
                    slot.id, slot.in_use, slot.request_id
                )));
            }
            if restored.insert(slot.id, slot).is_some() {
                return Err(ProvisionError::Config("duplicate slot id in state".into()));
            }
        }
        Ok(Self {
            slots: Mutex::new(restored),
        })
    }

    /// Ordered copy of every slot.
    pub async fn slots(&self) -> Vec<ResourceSlot> {
        self.slots.lock().await.values().cloned().collect()
    }

    pub async fn available(&self) -> usize {
        self.slots.lock().await.values().filter(|s| !s.in_use).count()
    }

    pub async fn owned_by(&self, request_id: RequestId) -> Vec<ResourceSlot> {
        self.slots
            .lock()
            .await
            .values()
            .filter(|s| s.request_id == Some(request_id))
            .cloned()
            .collect()
    }
}

/// Claims and releases slots on behalf of requests.
#[derive(Debug, Clone)]
pub struct Allocator {
    pool: Arc<ResourcePool>,
    catalog: TemplateCatalog,
}

impl Allocator {
    pub fn new(pool: Arc<ResourcePool>, catalog: TemplateCatalog) -> Self {
        Self { pool, catalog }
    }

    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    /// Claim the lowest-numbered `count` free slots for `request_id`.
    ///
    /// All-or-nothing: when fewer than `count` slots are free nothing is
    /// marked and `InsufficientCapacity` is returned.
    pub async fn claim(
        &self,
        request_id: RequestId,
        count: usize,
        owner_tag: Option<&str>,
    ) -> Result<Vec<ResourceSlot>> {
        let mut slots = self.pool.slots.lock().await;

        let chosen: Vec<SlotId> = slots
            .values()
            .filter(|s| !s.in_use)
            .take(count)
            .map(|s| s.id)
            .collect();

        if chosen.len() < count {
            warn!(
                request_id = %request_id,
                requested = count,
                available = chosen.len(),
                "slot claim rejected"
            );
            return Err(ProvisionError::InsufficientCapacity {
                requested: count,
                available: chosen.len(),
            });
        }

        let mut claimed = Vec::with_capacity(count);
        for id in chosen {
            if let Some(slot) = slots.get_mut(&id) {
                slot.occupy(request_id, owner_tag);
                claimed.push(slot.clone());
            }
        }

        info!(request_id = %request_id, slots = claimed.len(), "claimed slots");
        Ok(claimed)
    }

    /// Claim as many slots as `template` requires.
    pub async fn claim_for_template(
        &self,
        request_id: RequestId,
        template: &str,
        owner_tag: Option<&str>,
    ) -> Result<Vec<ResourceSlot>> {
        let count = self.catalog.slot_count(template);
        self.claim(request_id, count, owner_tag).await
    }

    /// Whether `template` could be claimed right now. Advisory only.
    pub async fn has_capacity_for(&self, template: &str) -> Result<()> {
        let requested = self.catalog.slot_count(template);
        let available = self.pool.available().await;
        if available < requested {
            return Err(ProvisionError::InsufficientCapacity {
                requested,
                available,
            });
        }
        Ok(())
    }

    /// Free every slot owned by `request_id`. Releasing nothing is fine.
    pub async fn release(&self, request_id: RequestId) -> Vec<SlotId> {
        let mut slots = self.pool.slots.lock().await;
        let released: Vec<SlotId> = slots
            .values_mut()
            .filter(|s| s.request_id == Some(request_id))
            .map(|s| {
                s.vacate();
                s.id
            })
            .collect();

        if released.is_empty() {
            debug!(request_id = %request_id, "no slots to release");
        } else {
            info!(request_id = %request_id, slots = released.len(), "released slots");
        }
        released
    }
}
