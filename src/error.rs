use thiserror::Error;

use crate::state_machine::RequestId;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("insufficient capacity: requested {requested} slots, {available} available")]
    InsufficientCapacity { requested: usize, available: usize },

    #[error("Request not found: {0}")]
    NotFound(RequestId),

    #[error("workflow fault: {0}")]
    WorkflowFault(String),

    #[error("cancelled")]
    Cancelled,

    #[error("workflow already launched for request {0}")]
    AlreadyLaunched(RequestId),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ProvisionError {
    /// Message recorded on a FAILED request for this error.
    pub fn failure_message(&self) -> String {
        match self {
            ProvisionError::WorkflowFault(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;
