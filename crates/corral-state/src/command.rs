//! Commands accepted by [`StateStore::apply`](crate::StateStore::apply).
//!
//! Each command is committed in one write transaction and advances the
//! write index by exactly one.

use serde::{Deserialize, Serialize};

use crate::types::*;
use crate::volume::HostVolume;

/// A client-reported allocation status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocClientUpdate {
    pub alloc_id: AllocId,
    pub client_status: AllocClientStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    UpsertNode {
        node: Node,
    },
    UpdateNodeStatus {
        node_id: NodeId,
        status: NodeStatus,
        event: Option<NodeEvent>,
        evals: Vec<Evaluation>,
    },
    UpdateNodeEligibility {
        node_id: NodeId,
        eligibility: SchedulingEligibility,
        event: Option<NodeEvent>,
        evals: Vec<Evaluation>,
    },
    UpsertJob {
        job: Job,
        eval: Option<Evaluation>,
        /// Commit only if the stored job's modify index still equals this.
        #[serde(default)]
        check_index: Option<u64>,
    },
    UpsertEvals {
        evals: Vec<Evaluation>,
    },
    DeleteEvals {
        eval_ids: Vec<EvalId>,
    },
    /// Rejected with `StalePlan` if any touched node or volume changed after
    /// the plan's snapshot index.
    ApplyPlan {
        plan: Plan,
    },
    UpdateAllocsFromClient {
        updates: Vec<AllocClientUpdate>,
        evals: Vec<Evaluation>,
    },
    UpsertHostVolumes {
        volumes: Vec<HostVolume>,
    },
    /// Rejected with `Conflict` if a volume is still claimed.
    DeleteHostVolumes {
        namespace: String,
        volume_ids: Vec<VolumeId>,
    },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::UpsertNode { .. } => "upsert_node",
            Command::UpdateNodeStatus { .. } => "update_node_status",
            Command::UpdateNodeEligibility { .. } => "update_node_eligibility",
            Command::UpsertJob { .. } => "upsert_job",
            Command::UpsertEvals { .. } => "upsert_evals",
            Command::DeleteEvals { .. } => "delete_evals",
            Command::ApplyPlan { .. } => "apply_plan",
            Command::UpdateAllocsFromClient { .. } => "update_allocs_from_client",
            Command::UpsertHostVolumes { .. } => "upsert_host_volumes",
            Command::DeleteHostVolumes { .. } => "delete_host_volumes",
        }
    }
}
