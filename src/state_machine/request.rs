use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::RequestStatus;

/// Stable identity of a provisioning request. Larger ids are newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One SSH-style access target produced by a successful workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

/// Final resource descriptor of a COMPLETED request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Load balancer / entry address; always the first generated address.
    pub primary_address: String,
    pub web_url: String,
    pub db_vip: String,
    pub access_targets: Vec<AccessTarget>,
}

/// Error detail of a FAILED request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestError {
    pub message: String,
}

/// A request for a virtual infrastructure and everything observed about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub id: RequestId,
    pub name: String,
    pub template: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Caller input as submitted.
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub log: Vec<String>,
    pub resources: Option<Resources>,
    pub error: Option<RequestError>,
    /// Human-readable address summary, the primary address once completed.
    #[serde(default)]
    pub assigned_address: String,
}

impl ProvisionRequest {
    pub fn new(id: RequestId, name: String, template: String, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            template,
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
            input,
            log: Vec::new(),
            resources: None,
            error: None,
            assigned_address: String::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Checks that resources and error are only present in their terminal status.
    pub fn is_consistent(&self) -> bool {
        let resources_ok = self.resources.is_some() == (self.status == RequestStatus::Completed);
        let error_ok = self.error.is_some() == (self.status == RequestStatus::Failed);
        resources_ok && error_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ProvisionRequest {
        ProvisionRequest::new(
            RequestId(7),
            "Shop Front".into(),
            "standard".into(),
            json!({"serviceName": "Shop Front"}),
        )
    }

    #[test]
    fn new_request_defaults() {
        let req = sample();
        assert_eq!(req.status, RequestStatus::Pending);
        assert!(req.log.is_empty());
        assert!(req.resources.is_none());
        assert!(req.error.is_none());
        assert!(req.assigned_address.is_empty());
        assert!(req.is_consistent());
    }

    #[test]
    fn inconsistent_when_resources_without_completion() {
        let mut req = sample();
        req.resources = Some(Resources {
            primary_address: "10.99.0.1".into(),
            web_url: "https://shop-front.mock.example.com".into(),
            db_vip: "db-shop-front.vip.mock.local".into(),
            access_targets: vec![],
        });
        assert!(!req.is_consistent());
    }

    #[test]
    fn nulls_survive_serialization() {
        let mut req = sample();
        req.log = vec!["Allocating IP...".into(), "Creating Web tier...".into()];
        let json = serde_json::to_value(&req).unwrap();
        assert!(json["resources"].is_null());
        assert!(json["error"].is_null());
        assert_eq!(json["status"], "PENDING");

        let back: ProvisionRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn request_id_display() {
        assert_eq!(RequestId(42).to_string(), "42");
    }
}
