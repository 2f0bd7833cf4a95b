//! Point-in-time, owned view of the whole store.
//!
//! Built from a single read transaction, so every table reflects the same
//! write index. Nothing in a snapshot is shared with the store: schedulers
//! and validators are free to work on it without further locking.

use std::collections::BTreeMap;

use crate::tables::{node_touch_key, volume_touch_key};
use crate::types::*;
use crate::volume::{HostVolume, volume_key};

#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub(crate) index: u64,
    pub(crate) nodes: BTreeMap<NodeId, Node>,
    /// Keyed by `{namespace}/{job_id}`.
    pub(crate) jobs: BTreeMap<String, Job>,
    pub(crate) allocs: BTreeMap<AllocId, Allocation>,
    pub(crate) evals: BTreeMap<EvalId, Evaluation>,
    /// Keyed by `{namespace}/{volume_id}`.
    pub(crate) host_volumes: BTreeMap<String, HostVolume>,
    pub(crate) touched: BTreeMap<String, u64>,
}

impl StateSnapshot {
    /// Write index this snapshot reflects.
    pub fn index(&self) -> u64 {
        self.index
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn node_by_id(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    /// Nodes ordered by ID.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_in_pool<'a>(&'a self, pool: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.values().filter(move |n| n.node_pool == pool)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub fn job_by_id(&self, namespace: &str, job_id: &str) -> Option<&Job> {
        self.jobs.get(&JobKey::new(namespace, job_id).table_key())
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    // ── Allocations ────────────────────────────────────────────────

    pub fn alloc_by_id(&self, alloc_id: &str) -> Option<&Allocation> {
        self.allocs.get(alloc_id)
    }

    pub fn allocs_by_job(&self, namespace: &str, job_id: &str) -> Vec<&Allocation> {
        self.allocs
            .values()
            .filter(|a| a.namespace == namespace && a.job_id == job_id)
            .collect()
    }

    pub fn allocs_by_node(&self, node_id: &str) -> Vec<&Allocation> {
        self.allocs
            .values()
            .filter(|a| a.node_id == node_id)
            .collect()
    }

    /// Non-terminal allocations holding a claim on the volume.
    pub fn volume_claims(&self, volume_id: &str) -> Vec<&Allocation> {
        self.allocs
            .values()
            .filter(|a| a.holds_claims() && a.volume_claims.iter().any(|c| c.volume_id == volume_id))
            .collect()
    }

    // ── Evaluations ────────────────────────────────────────────────

    pub fn eval_by_id(&self, eval_id: &str) -> Option<&Evaluation> {
        self.evals.get(eval_id)
    }

    pub fn evals(&self) -> impl Iterator<Item = &Evaluation> {
        self.evals.values()
    }

    // ── Host volumes ───────────────────────────────────────────────

    pub fn host_volume_by_id(&self, namespace: &str, volume_id: &str) -> Option<&HostVolume> {
        self.host_volumes.get(&volume_key(namespace, volume_id))
    }

    /// Volumes ordered by namespace, then ID.
    pub fn host_volumes(&self) -> impl Iterator<Item = &HostVolume> {
        self.host_volumes.values()
    }

    pub fn host_volumes_by_node(&self, node_id: &str) -> Vec<&HostVolume> {
        self.host_volumes
            .values()
            .filter(|v| v.node_id == node_id)
            .collect()
    }

    // ── Touch indexes ──────────────────────────────────────────────

    pub fn node_touch_index(&self, node_id: &str) -> u64 {
        self.touched.get(&node_touch_key(node_id)).copied().unwrap_or(0)
    }

    pub fn volume_touch_index(&self, volume_id: &str) -> u64 {
        self.touched.get(&volume_touch_key(volume_id)).copied().unwrap_or(0)
    }
}
