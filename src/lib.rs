//! Virtual infrastructure provisioning: a slot-pool allocator, a persisted
//! request store and an asynchronous workflow that drives each request from
//! PENDING to COMPLETED or FAILED.

pub mod backend;
pub mod config;
pub mod error;
pub mod persist;
pub mod pool;
pub mod scheduler;
pub mod service;
pub mod state_machine;
pub mod store;
pub mod workflow;

pub use backend::{MockBackend, PoolBackend, ResourceBackend};
pub use config::ProvisionerConfig;
pub use error::{ProvisionError, Result};
pub use pool::{Allocator, ResourcePool, ResourceSlot, SlotId};
pub use scheduler::{WorkflowHandle, WorkflowScheduler};
pub use service::Provisioner;
pub use state_machine::{ProvisionRequest, RequestId, RequestStatus, Resources};
pub use store::ProvisionRequestStore;
pub use workflow::{ProvisioningWorkflow, WorkflowOutcome};
