//! Node scoring for placement decisions.
//!
//! Best-fit bin-packing: a node scores by how full it will be after the
//! placement, averaged over CPU and memory. Fuller wins, which keeps large
//! contiguous capacity free on other nodes. Equal scores fall back to the
//! lowest node ID so placement is reproducible.

use std::cmp::Ordering;

use corral_state::{NodeId, Resources};

/// Capacity and current usage of a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUsage {
    pub node_id: NodeId,
    /// Allocatable capacity (total minus reserved).
    pub capacity: Resources,
    /// Sum of asks of allocations holding the node, including ones
    /// proposed earlier in the same plan.
    pub used: Resources,
}

impl NodeUsage {
    pub fn free(&self) -> Resources {
        self.capacity.saturating_sub(&self.used)
    }
}

/// Scored placement result for a single node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeScore {
    pub node_id: NodeId,
    /// Projected utilization after placement. Range: 0.0..=100.0.
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Individual score components for debugging.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBreakdown {
    pub cpu: f64,
    pub memory: f64,
}

fn projected(used: u64, ask: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        return 100.0;
    }
    ((used + ask) as f64 / capacity as f64).min(1.0) * 100.0
}

/// Score a node for one instance of `ask`. Returns the exhausted dimension
/// when the instance doesn't fit.
pub fn score_node(usage: &NodeUsage, ask: &Resources) -> Result<NodeScore, &'static str> {
    if let Some(dimension) = usage.free().exhausted_by(ask) {
        return Err(dimension);
    }

    let cpu = projected(usage.used.cpu_mhz, ask.cpu_mhz, usage.capacity.cpu_mhz);
    let memory = projected(usage.used.memory_mb, ask.memory_mb, usage.capacity.memory_mb);

    Ok(NodeScore {
        node_id: usage.node_id.clone(),
        score: (cpu + memory) / 2.0,
        breakdown: ScoreBreakdown { cpu, memory },
    })
}

/// Best first; equal scores ordered by node ID.
pub fn compare_scores(a: &NodeScore, b: &NodeScore) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.node_id.cmp(&b.node_id))
}
