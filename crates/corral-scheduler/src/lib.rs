//! corral-scheduler — the evaluation → plan → commit pipeline.
//!
//! Workers pull evaluations from the broker, reconcile the job against a
//! state snapshot and submit the resulting plan. Plans from every worker
//! funnel through one applier so commits are serialized and stale plans are
//! rejected rather than overcommitting a node.
//!
//! # Architecture
//!
//! ```text
//! EvalBroker ──dequeue──► Worker ──compute(snapshot)──► Plan
//!     ▲                     │                             │
//!     │ ack / nack          │                             ▼
//!     └─────────────────────┘◄──── PlanResult ◄──── PlanQueue (single applier)
//!                           │                             │
//!                           ▼                             ▼
//!                    BlockedEvals (failed placements)   StateStore
//! ```

pub mod error;
pub mod generic;
pub mod plan_queue;
pub mod worker;

pub use error::{SchedulerError, SchedulerResult};
pub use generic::{SchedulerOutput, compute};
pub use plan_queue::{PlanCommitCallback, PlanQueue};
pub use worker::{Worker, WorkerContext, WorkerPool};
