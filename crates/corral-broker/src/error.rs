use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("eval broker is not running on the leader")]
    NotLeader,

    #[error("evaluation {0} is not outstanding")]
    NotOutstanding(String),

    #[error("evaluation {0} is leased with a different token")]
    TokenMismatch(String),
}
