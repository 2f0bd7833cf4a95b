//! Node feasibility: readiness, constraint targets, and filter reasons.
//!
//! Reasons returned here become keys in
//! [`AllocMetric::constraint_filtered`](corral_state::AllocMetric), so they
//! are stable strings operators can grep for.

use std::cell::RefCell;
use std::collections::HashMap;

use regex::Regex;

use corral_state::{Constraint, ConstraintOperand, Node, NodeStatus};

pub const FILTER_NODE_NOT_READY: &str = "node not ready";
pub const FILTER_NODE_INELIGIBLE: &str = "node is ineligible for scheduling";
pub const FILTER_DISTINCT_HOSTS: &str = "distinct_hosts";
pub const FILTER_DISTINCT_PROPERTY: &str = "distinct_property";
pub const FILTER_MISSING_PROPERTY: &str = "missing property";
pub const FILTER_VOLUME_MISSING: &str = "missing compatible host volumes";
pub const FILTER_VOLUME_CAPABILITY: &str = "host volume capability mismatch";
pub const FILTER_VOLUME_CAPACITY: &str = "host volume capacity too small";
pub const FILTER_VOLUME_CLAIMED: &str = "host volume claimed by another allocation";

/// Resolve `${...}` interpolations against a node. Literals pass through.
pub fn resolve_target(target: &str, node: &Node) -> Option<String> {
    let Some(inner) = target.strip_prefix("${").and_then(|t| t.strip_suffix('}')) else {
        return Some(target.to_string());
    };
    match inner {
        "node.id" => Some(node.id.clone()),
        "node.name" => Some(node.name.clone()),
        "node.pool" => Some(node.node_pool.clone()),
        _ => {
            if let Some(key) = inner.strip_prefix("attr.") {
                node.attributes.get(key).cloned()
            } else if let Some(key) = inner.strip_prefix("meta.") {
                node.meta.get(key).cloned()
            } else {
                None
            }
        }
    }
}

/// `regexp` patterns compiled once per placement pass. Patterns that fail
/// to compile are remembered as `None` and never match.
#[derive(Debug, Default)]
pub struct RegexCache {
    compiled: RefCell<HashMap<String, Option<Regex>>>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_match(&self, pattern: &str, haystack: &str) -> bool {
        let mut compiled = self.compiled.borrow_mut();
        if let Some(re) = compiled.get(pattern) {
            return re.as_ref().is_some_and(|re| re.is_match(haystack));
        }
        let re = Regex::new(pattern).ok();
        let matched = re.as_ref().is_some_and(|re| re.is_match(haystack));
        compiled.insert(pattern.to_string(), re);
        matched
    }

    pub fn len(&self) -> usize {
        self.compiled.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Evaluate a single-node constraint. `distinct_*` operands need the
/// placement context and always pass here.
pub fn check_constraint(constraint: &Constraint, node: &Node, regexes: &RegexCache) -> bool {
    let l = resolve_target(&constraint.l_target, node);
    let r = resolve_target(&constraint.r_target, node);
    match constraint.operand {
        ConstraintOperand::Equal => l.is_some() && l == r,
        ConstraintOperand::NotEqual => l != r,
        ConstraintOperand::Regexp => match (l, r) {
            (Some(l), Some(r)) => regexes.is_match(&r, &l),
            _ => false,
        },
        ConstraintOperand::IsSet => l.is_some(),
        ConstraintOperand::IsNotSet => l.is_none(),
        ConstraintOperand::DistinctHosts | ConstraintOperand::DistinctProperty => true,
    }
}

/// Status and eligibility gate applied before anything else.
pub fn check_node_ready(node: &Node) -> Result<(), &'static str> {
    if node.status != NodeStatus::Ready {
        return Err(FILTER_NODE_NOT_READY);
    }
    if node.is_draining() {
        return Err(FILTER_NODE_INELIGIBLE);
    }
    Ok(())
}

/// First single-node constraint the node fails, rendered as the filter key.
pub fn first_failed_constraint<'c>(
    constraints: impl IntoIterator<Item = &'c Constraint>,
    node: &Node,
    regexes: &RegexCache,
) -> Option<String> {
    constraints
        .into_iter()
        .find(|c| !check_constraint(c, node, regexes))
        .map(|c| c.to_string())
}
