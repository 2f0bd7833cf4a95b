//! redb table definitions for the Corral state store.
//!
//! Entity tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Namespaced entities use `{namespace}/{id}` keys.

use redb::TableDefinition;

/// Nodes keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Jobs keyed by `{namespace}/{job_id}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Allocations keyed by `{alloc_id}`.
pub const ALLOCS: TableDefinition<&str, &[u8]> = TableDefinition::new("allocs");

/// Evaluations keyed by `{eval_id}`.
pub const EVALS: TableDefinition<&str, &[u8]> = TableDefinition::new("evals");

/// Host volumes keyed by `{namespace}/{volume_id}`.
pub const HOST_VOLUMES: TableDefinition<&str, &[u8]> = TableDefinition::new("host_volumes");

/// Plan results keyed by `{eval_id}`.
pub const PLAN_RESULTS: TableDefinition<&str, &[u8]> = TableDefinition::new("plan_results");

/// Write indexes: the latest overall index under [`LATEST_INDEX`], and the
/// last index at which each table changed under the table name.
pub const INDEXES: TableDefinition<&str, u64> = TableDefinition::new("indexes");

/// Last index at which a plan-relevant entity changed, keyed by
/// `node/{node_id}` (record or any allocation on it) and
/// `volume/{volume_id}` (record or any claim on it).
pub const TOUCHED: TableDefinition<&str, u64> = TableDefinition::new("touched");

pub const LATEST_INDEX: &str = "latest";

pub fn node_touch_key(node_id: &str) -> String {
    format!("node/{node_id}")
}

pub fn volume_touch_key(volume_id: &str) -> String {
    format!("volume/{volume_id}")
}
