//! Scheduler error types.

use corral_broker::BrokerError;
use corral_state::StateError;
use thiserror::Error;

/// Errors that can occur while computing or committing plans.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The plan queue is stopped; retry against the new leader.
    #[error("plan queue is not running on the leader")]
    NotLeader,

    /// Something the plan touches changed after its snapshot.
    #[error("plan is stale: {0}")]
    StalePlan(String),

    /// The plan conflicts with current state in a way a retry may fix.
    #[error("plan rejected: {0}")]
    Rejected(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("eval broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl SchedulerError {
    /// Recomputing against fresh state may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::NotLeader | SchedulerError::StalePlan(_) | SchedulerError::Rejected(_)
        )
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
