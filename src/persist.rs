//! JSON state file holding the request store and the slot pool.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProvisionError, Result};
use crate::pool::ResourceSlot;
use crate::store::StoreSnapshot;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    pub store: StoreSnapshot,
    pub slots: Vec<ResourceSlot>,
}

impl StateFile {
    /// Read the state file, `None` when it does not exist yet.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&contents)?;
        state.validate()?;
        debug!(path = %path.display(), "state loaded");
        Ok(Some(state))
    }

    /// Reject records whose status disagrees with their resources or error,
    /// and slots marked in use without an owning request.
    pub fn validate(&self) -> Result<()> {
        if let Some(request) = self.store.requests.iter().find(|r| !r.is_consistent()) {
            return Err(ProvisionError::Config(format!(
                "request {} is {} but resources/error do not match",
                request.id, request.status
            )));
        }
        if let Some(slot) = self.slots.iter().find(|s| !s.is_consistent()) {
            return Err(ProvisionError::Config(format!(
                "slot {} has in_use={} but request_id={:?}",
                slot.id, slot.in_use, slot.request_id
            )));
        }
        Ok(())
    }

    /// Write through a sibling temp file so a crash never leaves half a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), requests = self.store.requests.len(), "state saved");
        Ok(())
    }
}
