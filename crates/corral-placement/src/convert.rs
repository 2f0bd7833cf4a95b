//! Conversions from state snapshot records to placement inputs.
//!
//! Bridges `corral_state::{Node, Allocation}` to the scorer's
//! [`NodeUsage`], folding in the plan-local overlay: allocations the plan
//! already stops stop counting, allocations it already proposes start
//! counting.

use std::collections::HashSet;

use corral_state::{AllocId, Node, Resources, StateSnapshot};

use crate::scorer::NodeUsage;

/// Usage of `node` as seen by a plan in progress.
pub fn node_usage<'a>(
    snapshot: &StateSnapshot,
    node: &Node,
    stopping: &HashSet<AllocId>,
    proposed: impl IntoIterator<Item = &'a Resources>,
) -> NodeUsage {
    let mut used = Resources::default();
    for alloc in snapshot.allocs_by_node(&node.id) {
        if alloc.is_terminal() || stopping.contains(&alloc.id) {
            continue;
        }
        used.add(&alloc.resources);
    }
    for ask in proposed {
        used.add(ask);
    }

    NodeUsage {
        node_id: node.id.clone(),
        capacity: node.allocatable(),
        used,
    }
}
