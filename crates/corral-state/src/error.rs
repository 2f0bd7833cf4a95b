//! Error types for the Corral state store.

use std::fmt;

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A plan touched an entity that changed after the plan's snapshot.
    #[error("stale plan: {entity} modified at index {modify_index}, plan snapshot at {snapshot_index}")]
    StalePlan {
        entity: String,
        modify_index: u64,
        snapshot_index: u64,
    },

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Every problem found while validating a request, reported together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError {
    pub errors: Vec<String>,
}

impl ValidationError {
    pub fn push(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn extend(&mut self, other: ValidationError) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => f.write_str("no errors"),
            [only] => write!(f, "1 error occurred: {only}"),
            all => write!(f, "{} errors occurred: {}", all.len(), all.join("; ")),
        }
    }
}

impl std::error::Error for ValidationError {}
