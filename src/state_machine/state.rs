use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::request::{ProvisionRequest, RequestError, Resources};

/// Lifecycle status of a provisioning request.
///
/// Each request flows through: PENDING → RUNNING → COMPLETED | FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "PENDING"),
            RequestStatus::Running => write!(f, "RUNNING"),
            RequestStatus::Completed => write!(f, "COMPLETED"),
            RequestStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    /// Whether the workflow may move a request from `self` to `next`.
    ///
    /// RUNNING → RUNNING is allowed so each step can append its log line.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

/// A requested change to a stored request, merged by [`StateMachine::apply`].
///
/// `log_append` is concatenated onto the existing log; every other field
/// overwrites only when present.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: RequestStatus,
    pub log_append: Vec<String>,
    pub resources: Option<Resources>,
    pub error: Option<RequestError>,
    pub assigned_address: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: RequestStatus) -> Self {
        Self {
            status,
            log_append: Vec::new(),
            resources: None,
            error: None,
            assigned_address: None,
        }
    }

    /// A RUNNING step that appends one log line.
    pub fn running(message: impl Into<String>) -> Self {
        Self::new(RequestStatus::Running).log(message)
    }

    /// The COMPLETED transition carrying the resource descriptor.
    pub fn completed(resources: Resources) -> Self {
        let primary = resources.primary_address.clone();
        Self {
            resources: Some(resources),
            assigned_address: Some(primary),
            ..Self::new(RequestStatus::Completed)
        }
    }

    /// The FAILED transition: appends `Error: <message>` and records the error.
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            error: Some(RequestError {
                message: message.clone(),
            }),
            assigned_address: Some(String::new()),
            ..Self::new(RequestStatus::Failed).log(format!("Error: {message}"))
        }
    }

    pub fn log(mut self, line: impl Into<String>) -> Self {
        self.log_append.push(line.into());
        self
    }

    pub fn with_assigned_address(mut self, address: impl Into<String>) -> Self {
        self.assigned_address = Some(address.into());
        self
    }
}

/// Why a [`StatusUpdate`] was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The request already reached COMPLETED or FAILED.
    Terminal,
    /// The edge is not part of the lifecycle.
    IllegalEdge,
    /// COMPLETED must carry resources and only COMPLETED may.
    ResourcesMismatch,
    /// FAILED must carry an error and only FAILED may.
    ErrorMismatch,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Terminal => write!(f, "request is already terminal"),
            Rejection::IllegalEdge => write!(f, "illegal status transition"),
            Rejection::ResourcesMismatch => write!(f, "resources only accompany COMPLETED"),
            Rejection::ErrorMismatch => write!(f, "error only accompanies FAILED"),
        }
    }
}

/// The result of evaluating a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied {
        from: RequestStatus,
        to: RequestStatus,
    },
    Rejected {
        from: RequestStatus,
        to: RequestStatus,
        reason: Rejection,
    },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}

/// Drives a [`ProvisionRequest`] through its lifecycle.
pub struct StateMachine;

impl StateMachine {
    /// Validate `update` against the current status of `request` and merge it
    /// in place when legal. A rejected update leaves the request untouched.
    pub fn apply(request: &mut ProvisionRequest, update: StatusUpdate) -> Transition {
        let from = request.status;
        let to = update.status;

        if let Some(reason) = Self::check(from, &update) {
            return Transition::Rejected { from, to, reason };
        }

        request.status = to;
        request.log.extend(update.log_append);
        if let Some(resources) = update.resources {
            request.resources = Some(resources);
        }
        if let Some(error) = update.error {
            request.error = Some(error);
        }
        if let Some(address) = update.assigned_address {
            request.assigned_address = address;
        }
        request.updated_at = Utc::now();

        Transition::Applied { from, to }
    }

    fn check(from: RequestStatus, update: &StatusUpdate) -> Option<Rejection> {
        let to = update.status;
        if from.is_terminal() {
            return Some(Rejection::Terminal);
        }
        if !from.can_transition_to(to) {
            return Some(Rejection::IllegalEdge);
        }
        if update.resources.is_some() != (to == RequestStatus::Completed) {
            return Some(Rejection::ResourcesMismatch);
        }
        if update.error.is_some() != (to == RequestStatus::Failed) {
            return Some(Rejection::ErrorMismatch);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::request::{AccessTarget, RequestId};

    fn make_request() -> ProvisionRequest {
        ProvisionRequest::new(
            RequestId(1),
            "billing".into(),
            "single".into(),
            serde_json::Value::Null,
        )
    }

    fn resources() -> Resources {
        Resources {
            primary_address: "10.99.0.12".into(),
            web_url: "https://billing.mock.example.com".into(),
            db_vip: "db-billing.vip.mock.local".into(),
            access_targets: vec![AccessTarget {
                host: "10.99.0.12".into(),
                port: 22,
                user: "ubuntu".into(),
            }],
        }
    }

    #[test]
    fn happy_path_walks_all_states() {
        let mut req = make_request();

        let t = StateMachine::apply(&mut req, StatusUpdate::running("Allocating IP..."));
        assert_eq!(
            t,
            Transition::Applied {
                from: RequestStatus::Pending,
                to: RequestStatus::Running
            }
        );

        let t = StateMachine::apply(&mut req, StatusUpdate::running("Creating Web tier..."));
        assert!(t.is_applied());
        assert_eq!(req.log, vec!["Allocating IP...", "Creating Web tier..."]);

        let t = StateMachine::apply(&mut req, StatusUpdate::completed(resources()));
        assert!(t.is_applied());
        assert_eq!(req.status, RequestStatus::Completed);
        assert_eq!(req.assigned_address, "10.99.0.12");
        assert!(req.is_consistent());
    }

    #[test]
    fn terminal_state_rejects_everything() {
        let mut req = make_request();
        StateMachine::apply(&mut req, StatusUpdate::running("step"));
        StateMachine::apply(&mut req, StatusUpdate::failed("boom"));
        let snapshot = req.clone();

        for update in [
            StatusUpdate::running("late"),
            StatusUpdate::completed(resources()),
            StatusUpdate::failed("again"),
        ] {
            let t = StateMachine::apply(&mut req, update);
            assert!(matches!(
                t,
                Transition::Rejected {
                    reason: Rejection::Terminal,
                    ..
                }
            ));
        }
        assert_eq!(req, snapshot);
    }

    #[test]
    fn failure_appends_error_line() {
        let mut req = make_request();
        StateMachine::apply(&mut req, StatusUpdate::running("Allocating IP..."));
        StateMachine::apply(&mut req, StatusUpdate::failed("vcenter unreachable"));

        assert_eq!(req.status, RequestStatus::Failed);
        assert_eq!(req.log.last().unwrap(), "Error: vcenter unreachable");
        assert_eq!(req.error.as_ref().unwrap().message, "vcenter unreachable");
        assert!(req.resources.is_none());
        assert!(req.is_consistent());
    }

    #[test]
    fn pending_cannot_complete_directly() {
        let mut req = make_request();
        let t = StateMachine::apply(&mut req, StatusUpdate::completed(resources()));
        assert!(matches!(
            t,
            Transition::Rejected {
                reason: Rejection::IllegalEdge,
                ..
            }
        ));
        assert_eq!(req.status, RequestStatus::Pending);
    }

    #[test]
    fn coupling_is_enforced() {
        let mut req = make_request();
        StateMachine::apply(&mut req, StatusUpdate::running("step"));

        let bare_completion = StatusUpdate::new(RequestStatus::Completed);
        let t = StateMachine::apply(&mut req, bare_completion);
        assert!(matches!(
            t,
            Transition::Rejected {
                reason: Rejection::ResourcesMismatch,
                ..
            }
        ));

        let mut running_with_error = StatusUpdate::running("step");
        running_with_error.error = Some(RequestError {
            message: "nope".into(),
        });
        let t = StateMachine::apply(&mut req, running_with_error);
        assert!(matches!(
            t,
            Transition::Rejected {
                reason: Rejection::ErrorMismatch,
                ..
            }
        ));
        assert!(req.is_consistent());
    }

    #[test]
    fn status_display() {
        assert_eq!(RequestStatus::Pending.to_string(), "PENDING");
        assert_eq!(RequestStatus::Running.to_string(), "RUNNING");
        assert_eq!(RequestStatus::Completed.to_string(), "COMPLETED");
        assert_eq!(RequestStatus::Failed.to_string(), "FAILED");
    }
}
