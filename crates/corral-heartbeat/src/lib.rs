//! corral-heartbeat — leader-side failure detection for client nodes.
//!
//! Each live node owns a lease. Heartbeats renew it; a lease that runs out
//! marks the node down in the state store with a "Node heartbeat missed"
//! event.
//!
//! # Architecture
//!
//! ```text
//! HeartbeatMonitor
//!   ├── TimerTable (one mutex)
//!   │   ├── epoch: Option<LeaderEpoch>
//!   │   └── node_id → TimerSlot { task, generation }
//!   ├── initialize(epoch)  ← leadership gained, rebuilt from the store
//!   ├── renew(node_id)     ← Heartbeat RPC, returns the TTL
//!   ├── clear_all()        ← leadership lost
//!   └── expiry ─► UpdateNodeStatus(down) ─► NodeDownCallback
//! ```
//!
//! # TTLs
//!
//! The base TTL grows with cluster size so the leader sees at most
//! `max_heartbeats_per_second` renewals, and never drops below
//! `min_heartbeat_ttl`. A random stagger in `[0, base]` spreads renewals
//! out. The grace period is added to the timer only, never to the TTL
//! handed back to the client.

pub mod error;
pub mod monitor;

pub use error::{HeartbeatError, HeartbeatResult};
pub use monitor::{BoxFuture, HeartbeatMonitor, NodeDownCallback, random_stagger, rate_scaled_interval};
