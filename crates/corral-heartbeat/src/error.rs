use corral_state::StateError;
use thiserror::Error;

pub type HeartbeatResult<T> = Result<T, HeartbeatError>;

#[derive(Debug, Error)]
pub enum HeartbeatError {
    /// Timers only run on the leader.
    #[error("heartbeat monitor is not running on the leader")]
    NotLeader,

    #[error(transparent)]
    State(#[from] StateError),
}
