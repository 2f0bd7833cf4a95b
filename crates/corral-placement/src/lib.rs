//! Corral placement — picks nodes for task group instances and host volumes.
//!
//! Placement is a pure function of a [`StateSnapshot`](corral_state::StateSnapshot)
//! plus the plan being built; it never writes state. Schedulers feed the
//! result into a plan and the plan applier decides whether it still holds.
//!
//! ```text
//!   nodes_in_pool ──► ready? ──► constraints ──► distinct_* ──► volumes ──► score
//!                       │            │               │             │          │
//!                       └────────────┴───── AllocMetric ───────────┘     best fit
//! ```
//!
//! # Components
//!
//! - **`feasible`** — readiness gate, `${...}` targets, constraint operands
//! - **`volumes`** — host volume matching and claim selection
//! - **`scorer`** — best-fit bin-packing scores
//! - **`convert`** — snapshot records to scorer inputs
//! - **`placer`** — the [`Allocator`] tying them together
//! - **`volume_node`** — node choice for new host volumes

pub mod convert;
pub mod error;
pub mod feasible;
pub mod placer;
pub mod scorer;
pub mod volume_node;
pub mod volumes;

pub use error::PlacementError;
pub use placer::{Allocator, GroupPlacement, Placement};
pub use scorer::{NodeScore, NodeUsage, score_node};
pub use volume_node::{check_volume_node, select_volume_node};
pub use volumes::select_claims;
