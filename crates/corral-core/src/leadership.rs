//! Leadership epochs.
//!
//! Every leader-only component (heartbeat timers, eval broker, plan queue)
//! is started with the epoch of the term that owns it. Background tasks
//! carry the epoch they were spawned under and drop their work once the
//! component has moved on to a different epoch or been stopped.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LeaderEpoch(u64);

impl LeaderEpoch {
    pub const fn new(term: u64) -> Self {
        Self(term)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for LeaderEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epochs_are_ordered() {
        let first = LeaderEpoch::new(1);
        let second = first.next();
        assert!(second > first);
        assert_eq!(second.get(), 2);
        assert_eq!(second.to_string(), "epoch-2");
    }
}
