mod request;
mod state;

pub use request::{AccessTarget, ProvisionRequest, RequestError, RequestId, Resources};
pub use state::{Rejection, RequestStatus, StateMachine, StatusUpdate, Transition};
