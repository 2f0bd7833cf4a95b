//! Server error types.

use corral_broker::BrokerError;
use corral_heartbeat::HeartbeatError;
use corral_placement::PlacementError;
use corral_scheduler::SchedulerError;
use corral_state::{StateError, ValidationError};
use thiserror::Error;

pub type ServerResult<T> = Result<T, ServerError>;

/// Errors returned by server endpoints.
#[derive(Debug, Error)]
pub enum ServerError {
    /// This server does not hold leadership. Retry against the leader.
    #[error("not the leader")]
    NotLeader,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("stale plan: {0}")]
    StalePlan(String),

    /// The volume provisioner refused or failed.
    #[error("volume provisioner: {0}")]
    Provisioner(String),

    #[error("state store error: {0}")]
    State(StateError),
}

impl ServerError {
    /// The caller may retry, possibly against a different server.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServerError::NotLeader | ServerError::StalePlan(_))
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        let mut err = ValidationError::default();
        err.push(message);
        ServerError::Validation(err)
    }
}

impl From<StateError> for ServerError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(what) => ServerError::NotFound(what),
            StateError::Conflict(reason) => ServerError::Conflict(reason),
            e @ StateError::StalePlan { .. } => ServerError::StalePlan(e.to_string()),
            e => ServerError::State(e),
        }
    }
}

impl From<HeartbeatError> for ServerError {
    fn from(e: HeartbeatError) -> Self {
        match e {
            HeartbeatError::NotLeader => ServerError::NotLeader,
            HeartbeatError::State(e) => e.into(),
        }
    }
}

impl From<BrokerError> for ServerError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::NotLeader => ServerError::NotLeader,
            e => ServerError::Conflict(e.to_string()),
        }
    }
}

impl From<SchedulerError> for ServerError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::NotLeader => ServerError::NotLeader,
            SchedulerError::StalePlan(msg) => ServerError::StalePlan(msg),
            SchedulerError::Rejected(msg) => ServerError::Conflict(msg),
            SchedulerError::State(e) => e.into(),
            SchedulerError::Broker(e) => e.into(),
        }
    }
}

impl From<PlacementError> for ServerError {
    fn from(e: PlacementError) -> Self {
        match e {
            PlacementError::NodeNotFound(id) => ServerError::NotFound(format!("node {id}")),
            e => ServerError::invalid(e.to_string()),
        }
    }
}
