use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("no node in pool {pool:?} can host the volume: {reason}")]
    NoEligibleNode { pool: String, reason: String },

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("node {node_id} cannot host the volume: {reason}")]
    NodeIneligible { node_id: String, reason: String },
}
