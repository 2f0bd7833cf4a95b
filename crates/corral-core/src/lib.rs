//! corral-core — configuration and leadership primitives shared by every
//! control-plane crate.

pub mod config;
pub mod leadership;

pub use config::{BrokerConfig, GcConfig, HeartbeatConfig, SchedulerConfig, ServerConfig};
pub use leadership::LeaderEpoch;
