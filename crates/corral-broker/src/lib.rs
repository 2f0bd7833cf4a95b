//! corral-broker — leader-side queues of scheduling work.
//!
//! - **`broker`** — [`EvalBroker`]: priority delivery to workers, one
//!   in-flight evaluation per job, leases with automatic nack, delivery
//!   limit
//! - **`blocked`** — [`BlockedEvals`]: evaluations parked until capacity
//!   changes
//!
//! Both are started with the [`LeaderEpoch`](corral_core::LeaderEpoch) of
//! the term that owns them and emptied when that term ends.

pub mod blocked;
pub mod broker;
pub mod error;

pub use blocked::BlockedEvals;
pub use broker::{BrokerStats, Delivery, EvalBroker, EvalState};
pub use error::{BrokerError, BrokerResult};
