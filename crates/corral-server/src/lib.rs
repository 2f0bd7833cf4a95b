//! corral-server — the leader-side control plane.
//!
//! Ties the state store, heartbeat monitor, eval broker, blocked-eval
//! tracker, plan queue and scheduling workers together behind a single
//! [`Server`] handle. Every write endpoint commits through the state store
//! and then hands the resulting evaluations to the broker.
//!
//! # Architecture
//!
//! ```text
//! Server
//!   ├── node.rs    register / heartbeat / status / drain / alloc updates
//!   ├── job.rs     register / deregister / scale
//!   ├── volume.rs  create / register / delete / get / list host volumes
//!   ├── eval.rs    evaluation status, plan results, broker stats
//!   └── server.rs  leadership: establish ─► restore ─► workers + housekeeping
//!                              revoke    ─► stop broker, timers, workers
//!
//! HeartbeatMonitor ──(TTL expired)──► node_down ──► node evals ──► EvalBroker
//! PlanQueue ──(allocs stopped)──► BlockedEvals::unblock ──► EvalBroker
//! ```

pub mod error;
pub mod eval;
pub mod job;
pub mod node;
pub mod provisioner;
pub mod server;
pub mod volume;

pub use error::{ServerError, ServerResult};
pub use eval::EvalStatusResponse;
pub use job::{JobScaleRequest, JobWriteResponse};
pub use node::{HeartbeatResponse, NodeUpdateResponse};
pub use provisioner::{ProvisionedVolume, StaticProvisioner, VolumeProvisioner};
pub use server::Server;
pub use volume::{VolumeDeleteResponse, VolumeListRequest, VolumeListResponse, VolumeWriteResponse};
