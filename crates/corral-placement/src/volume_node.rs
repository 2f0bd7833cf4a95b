//! Node selection for new host volumes.
//!
//! A volume created without a node is placed on a ready node in its pool
//! that passes the volume's constraints and does not already host a volume
//! with the same name in the same namespace. Among those, the node hosting
//! the fewest volumes wins, then the lowest node ID.

use corral_state::{DEFAULT_NODE_POOL, HostVolume, Node, NodeId, StateSnapshot};

use crate::error::PlacementError;
use crate::feasible::{RegexCache, check_node_ready, first_failed_constraint};

const FILTER_NAME_TAKEN: &str = "node already hosts a volume with this name";
const FILTER_WRONG_POOL: &str = "node is not in the volume's node pool";

/// Check a caller-chosen node against the same rules placement uses.
pub fn check_volume_node(
    snapshot: &StateSnapshot,
    node: &Node,
    volume: &HostVolume,
) -> Result<(), String> {
    volume_node_fit(snapshot, node, volume, &RegexCache::new())
}

fn volume_node_fit(
    snapshot: &StateSnapshot,
    node: &Node,
    volume: &HostVolume,
    regexes: &RegexCache,
) -> Result<(), String> {
    let pool = pool_of(volume);
    if node.node_pool != pool {
        return Err(FILTER_WRONG_POOL.to_string());
    }
    check_node_ready(node).map_err(str::to_string)?;
    if let Some(failed) = first_failed_constraint(&volume.constraints, node, regexes) {
        return Err(failed);
    }
    let taken = snapshot.host_volumes_by_node(&node.id).into_iter().any(|v| {
        v.namespace == volume.namespace && v.name == volume.name && v.id != volume.id
    });
    if taken {
        return Err(FILTER_NAME_TAKEN.to_string());
    }
    Ok(())
}

/// Pick a node for a volume that names none.
pub fn select_volume_node(
    snapshot: &StateSnapshot,
    volume: &HostVolume,
) -> Result<NodeId, PlacementError> {
    let pool = pool_of(volume);
    let mut last_reason = String::from("no nodes in pool");
    let mut best: Option<(usize, &Node)> = None;
    let regexes = RegexCache::new();

    for node in snapshot.nodes_in_pool(pool) {
        if let Err(reason) = volume_node_fit(snapshot, node, volume, &regexes) {
            last_reason = reason;
            continue;
        }
        let hosted = snapshot.host_volumes_by_node(&node.id).len();
        let better = best.is_none_or(|(count, current)| {
            (hosted, node.id.as_str()) < (count, current.id.as_str())
        });
        if better {
            best = Some((hosted, node));
        }
    }

    best.map(|(_, node)| node.id.clone())
        .ok_or_else(|| PlacementError::NoEligibleNode {
            pool: pool.to_string(),
            reason: last_reason,
        })
}

fn pool_of(volume: &HostVolume) -> &str {
    if volume.node_pool.is_empty() {
        DEFAULT_NODE_POOL
    } else {
        &volume.node_pool
    }
}
