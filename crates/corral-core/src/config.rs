//! corral.toml server configuration.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! usable single-server setup. Durations are expressed in milliseconds on
//! disk and exposed as [`Duration`] through accessor methods.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name this server reports in logs and leadership transitions.
    pub node_id: String,
    /// Directory for the redb state file. In-memory store when absent.
    pub data_dir: Option<PathBuf>,
    pub api_addr: SocketAddr,
    pub heartbeat: HeartbeatConfig,
    pub broker: BrokerConfig,
    pub scheduler: SchedulerConfig,
    pub gc: GcConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub min_heartbeat_ttl_ms: u64,
    /// Upper bound on heartbeats the leader wants to process per second.
    /// Large clusters get a longer TTL base so the rate stays under this.
    pub max_heartbeats_per_second: f64,
    /// Slack added to the timer, but not to the TTL handed to the client.
    pub heartbeat_grace_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub eval_nack_timeout_ms: u64,
    pub eval_delivery_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub num_schedulers: usize,
    pub dequeue_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub eval_gc_interval_ms: u64,
    /// Number of write indexes an evaluation must have been terminal for
    /// before it is collected.
    pub eval_gc_threshold: u64,
    pub reap_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: "corral-server".to_string(),
            data_dir: None,
            api_addr: SocketAddr::from(([127, 0, 0, 1], 4646)),
            heartbeat: HeartbeatConfig::default(),
            broker: BrokerConfig::default(),
            scheduler: SchedulerConfig::default(),
            gc: GcConfig::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            min_heartbeat_ttl_ms: 10_000,
            max_heartbeats_per_second: 50.0,
            heartbeat_grace_ms: 10_000,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            eval_nack_timeout_ms: 60_000,
            eval_delivery_limit: 3,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_schedulers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            dequeue_timeout_ms: 500,
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            eval_gc_interval_ms: 300_000,
            eval_gc_threshold: 1_000,
            reap_interval_ms: 5_000,
        }
    }
}

impl HeartbeatConfig {
    pub fn min_ttl(&self) -> Duration {
        Duration::from_millis(self.min_heartbeat_ttl_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.heartbeat_grace_ms)
    }
}

impl BrokerConfig {
    pub fn nack_timeout(&self) -> Duration {
        Duration::from_millis(self.eval_nack_timeout_ms)
    }
}

impl SchedulerConfig {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }
}

impl GcConfig {
    pub fn eval_gc_interval(&self) -> Duration {
        Duration::from_millis(self.eval_gc_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings that would stall the control plane.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat.min_heartbeat_ttl_ms == 0 {
            bail!("heartbeat.min_heartbeat_ttl_ms must be greater than zero");
        }
        let rate = self.heartbeat.max_heartbeats_per_second;
        if rate.is_nan() || rate <= 0.0 {
            bail!("heartbeat.max_heartbeats_per_second must be positive");
        }
        if self.broker.eval_delivery_limit == 0 {
            bail!("broker.eval_delivery_limit must be at least 1");
        }
        if self.broker.eval_nack_timeout_ms == 0 {
            bail!("broker.eval_nack_timeout_ms must be greater than zero");
        }
        if self.scheduler.num_schedulers == 0 {
            bail!("scheduler.num_schedulers must be at least 1");
        }
        if self.scheduler.dequeue_timeout_ms == 0 {
            bail!("scheduler.dequeue_timeout_ms must be greater than zero");
        }
        if self.gc.reap_interval_ms == 0 {
            bail!("gc.reap_interval_ms must be greater than zero");
        }
        if self.gc.eval_gc_interval_ms == 0 {
            bail!("gc.eval_gc_interval_ms must be greater than zero");
        }
        Ok(())
    }
}
