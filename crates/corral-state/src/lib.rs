//! corral-state — the versioned state store and cluster data model.
//!
//! Backed by [redb](https://docs.rs/redb). The store is the single source of
//! truth for nodes, jobs, allocations, evaluations, host volumes, and plan
//! results.
//!
//! # Architecture
//!
//! ```text
//!   Command ──► StateStore::apply ──► one redb write txn ──► index N+1
//!                                          │
//!                  touch indexes ◄─────────┘ (node/<id>, volume/<id>)
//!
//!   StateStore::snapshot ──► StateSnapshot (owned, one read txn)
//! ```
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod command;
pub mod constraint;
pub mod error;
pub mod snapshot;
pub mod store;
pub mod tables;
pub mod types;
pub mod volume;

pub use command::{AllocClientUpdate, Command};
pub use constraint::{Constraint, ConstraintOperand};
pub use error::{StateError, StateResult, ValidationError};
pub use snapshot::StateSnapshot;
pub use store::StateStore;
pub use types::*;
pub use volume::*;
