//! Heartbeat monitor — one lease timer per live node, leader only.
//!
//! The timer table is derived state. It is rebuilt from the state store
//! every time leadership is gained and dropped entirely when it is lost.
//! The store stays the source of truth for node status; an expired timer
//! only triggers a write to it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use corral_core::{HeartbeatConfig, LeaderEpoch};
use corral_state::{Command, NodeEvent, NodeId, NodeStatus, StateStore};

use crate::error::{HeartbeatError, HeartbeatResult};

/// Callback invoked after a node has been marked down.
///
/// The server uses this to raise evaluations for the node's allocations.
pub type NodeDownCallback = Arc<dyn Fn(NodeId) -> BoxFuture + Send + Sync>;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct TimerSlot {
    handle: JoinHandle<()>,
    /// Distinguishes this timer from the one that replaced it.
    generation: u64,
}

#[derive(Default)]
struct TimerTable {
    /// `None` while not leader.
    epoch: Option<LeaderEpoch>,
    timers: HashMap<NodeId, TimerSlot>,
    next_generation: u64,
}

impl TimerTable {
    fn abort_all(&mut self) -> usize {
        let count = self.timers.len();
        for (_, slot) in self.timers.drain() {
            slot.handle.abort();
        }
        count
    }
}

/// Heartbeat TTL base: the larger of `min_ttl` and the interval that keeps
/// `node_count` renewals under `max_per_second`.
pub fn rate_scaled_interval(max_per_second: f64, min_ttl: Duration, node_count: usize) -> Duration {
    let interval = Duration::from_secs_f64(node_count as f64 / max_per_second);
    interval.max(min_ttl)
}

/// A random duration in `[0, base]`.
pub fn random_stagger(base: Duration) -> Duration {
    let ms = base.as_millis().min(u64::MAX as u128) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
}

/// Tracks node leases and invalidates nodes that stop heartbeating.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    state: StateStore,
    config: HeartbeatConfig,
    table: Arc<Mutex<TimerTable>>,
    on_node_down: Option<NodeDownCallback>,
}

impl HeartbeatMonitor {
    pub fn new(state: StateStore, config: HeartbeatConfig) -> Self {
        Self {
            state,
            config,
            table: Arc::new(Mutex::new(TimerTable::default())),
            on_node_down: None,
        }
    }

    /// Set a callback for nodes marked down by an expired lease.
    pub fn with_callback(mut self, callback: NodeDownCallback) -> Self {
        self.on_node_down = Some(callback);
        self
    }

    /// Start a leadership term: one timer for every non-terminal node.
    ///
    /// Fails without arming anything if the store cannot be read.
    pub async fn initialize(&self, epoch: LeaderEpoch) -> HeartbeatResult<usize> {
        let nodes = self.state.list_nodes()?;

        let mut table = self.table.lock().await;
        table.abort_all();
        table.epoch = Some(epoch);

        let live: Vec<NodeId> = nodes
            .into_iter()
            .filter(|n| !n.status.is_terminal())
            .map(|n| n.id)
            .collect();
        for node_id in live {
            let ttl = self.next_ttl(live_count(&table));
            self.reset_locked(&mut table, node_id, ttl + self.config.grace(), epoch);
        }

        let armed = table.timers.len();
        info!(%epoch, timers = armed, "heartbeat timers initialized");
        Ok(armed)
    }

    /// Renew a node's lease and return the TTL the client should honor.
    ///
    /// Creates the timer if the node has none yet.
    pub async fn renew(&self, node_id: &str) -> HeartbeatResult<Duration> {
        let mut table = self.table.lock().await;
        let Some(epoch) = table.epoch else {
            return Err(HeartbeatError::NotLeader);
        };

        let ttl = self.next_ttl(live_count(&table));
        self.reset_locked(&mut table, node_id.to_string(), ttl + self.config.grace(), epoch);
        debug!(%node_id, ttl_ms = ttl.as_millis() as u64, "heartbeat renewed");
        Ok(ttl)
    }

    /// Drop a node's timer without touching its status.
    pub async fn clear(&self, node_id: &str) {
        let mut table = self.table.lock().await;
        if let Some(slot) = table.timers.remove(node_id) {
            slot.handle.abort();
            debug!(%node_id, "heartbeat timer cleared");
        }
    }

    /// End the leadership term: every timer is discarded.
    pub async fn clear_all(&self) {
        let mut table = self.table.lock().await;
        let cleared = table.abort_all();
        let epoch = table.epoch.take();
        if let Some(epoch) = epoch {
            info!(%epoch, cleared, "heartbeat timers cleared");
        }
    }

    pub async fn timer_count(&self) -> usize {
        self.table.lock().await.timers.len()
    }

    pub async fn has_timer(&self, node_id: &str) -> bool {
        self.table.lock().await.timers.contains_key(node_id)
    }

    pub async fn is_active(&self) -> bool {
        self.table.lock().await.epoch.is_some()
    }

    /// Mark a node down with a "missed heartbeat" event.
    ///
    /// Returns `false` when the node is unknown or already down.
    pub async fn invalidate(&self, node_id: &str) -> HeartbeatResult<bool> {
        let Some(node) = self.state.get_node(node_id)? else {
            debug!(%node_id, "expired heartbeat for unknown node");
            return Ok(false);
        };
        if node.status.is_terminal() {
            return Ok(false);
        }

        let index = self.state.apply(Command::UpdateNodeStatus {
            node_id: node_id.to_string(),
            status: NodeStatus::Down,
            event: Some(NodeEvent::heartbeat_missed()),
            evals: Vec::new(),
        })?;
        warn!(%node_id, index, "node heartbeat missed, marked down");

        if let Some(ref callback) = self.on_node_down {
            callback(node_id.to_string()).await;
        }
        Ok(true)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn next_ttl(&self, node_count: usize) -> Duration {
        let base = rate_scaled_interval(
            self.config.max_heartbeats_per_second,
            self.config.min_ttl(),
            node_count,
        );
        base + random_stagger(base)
    }

    /// Replace the node's timer. Caller holds the table lock.
    fn reset_locked(
        &self,
        table: &mut TimerTable,
        node_id: NodeId,
        after: Duration,
        epoch: LeaderEpoch,
    ) {
        let generation = table.next_generation;
        table.next_generation += 1;

        let monitor = self.clone();
        let id = node_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            monitor.expire(&id, generation, epoch).await;
        });

        if let Some(old) = table.timers.insert(node_id, TimerSlot { handle, generation }) {
            old.handle.abort();
        }
    }

    /// Timer-driven. Removes the entry under the lock, then writes without it.
    async fn expire(&self, node_id: &str, generation: u64, epoch: LeaderEpoch) {
        {
            let mut table = self.table.lock().await;
            if table.epoch != Some(epoch) {
                return;
            }
            match table.timers.get(node_id) {
                Some(slot) if slot.generation == generation => {}
                _ => return,
            }
            table.timers.remove(node_id);
        }

        // Leadership may have moved on while the lock was released.
        if self.table.lock().await.epoch != Some(epoch) {
            return;
        }

        if let Err(e) = self.invalidate(node_id).await {
            error!(%node_id, error = %e, "failed to invalidate node");
        }
    }
}

fn live_count(table: &TimerTable) -> usize {
    table.timers.len() + 1
}
