//! Node endpoints: registration, heartbeats, status, drain, alloc updates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use corral_state::{
    AllocClientStatus, AllocClientUpdate, Allocation, Command, EvalTrigger, Evaluation, Node,
    NodeEvent, NodeStatus, SchedulingEligibility, NODE_EVENT_DEREGISTERED,
    NODE_EVENT_DRAIN_DISABLED, NODE_EVENT_DRAIN_ENABLED, NODE_EVENT_REGISTERED,
    NODE_EVENT_REREGISTERED, NODE_EVENT_SUBSYSTEM_CLUSTER, NODE_EVENT_SUBSYSTEM_DRAIN,
};

use crate::error::{ServerError, ServerResult};
use crate::server::Server;

/// Reply to node writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdateResponse {
    pub index: u64,
    /// Lease the client must renew within. Zero when the node has none.
    pub heartbeat_ttl_ms: u64,
    pub eval_ids: Vec<String>,
}

/// Reply to a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub heartbeat_ttl_ms: u64,
    /// Index of the status change, if the heartbeat revived the node.
    pub index: Option<u64>,
}

impl Server {
    /// Register a node, or re-register a known one.
    pub async fn register_node(&self, mut node: Node) -> ServerResult<NodeUpdateResponse> {
        self.ensure_leader()?;
        node.canonicalize();
        node.validate()?;
        if node.status.is_terminal() {
            return Err(ServerError::invalid(format!(
                "invalid status {} for node registration",
                node.status
            )));
        }

        let existing = self.inner.state.get_node(&node.id)?;
        let message = match &existing {
            Some(existing) => {
                node.scheduling_eligibility = existing.scheduling_eligibility;
                NODE_EVENT_REREGISTERED
            }
            None => NODE_EVENT_REGISTERED,
        };
        node.events = vec![NodeEvent::new(NODE_EVENT_SUBSYSTEM_CLUSTER, message)];

        let node_id = node.id.clone();
        let schedulable = node.is_schedulable();
        let index = self.inner.state.apply(Command::UpsertNode { node })?;

        let evals = self.commit_node_evals(&node_id, EvalTrigger::NodeUpdate)?;
        if schedulable {
            self.inner.dispatch.unblock(index)?;
        }
        let ttl = self.inner.heartbeat.renew(&node_id).await?;
        info!(%node_id, index, reregistered = existing.is_some(), "node registered");

        Ok(NodeUpdateResponse {
            index,
            heartbeat_ttl_ms: ttl.as_millis() as u64,
            eval_ids: evals,
        })
    }

    /// Mark a node down and drop its lease. Its allocations get evaluated.
    pub async fn deregister_node(&self, node_id: &str) -> ServerResult<NodeUpdateResponse> {
        self.ensure_leader()?;
        self.node_or_not_found(node_id)?;

        let evals = self
            .inner
            .dispatch
            .node_evals(node_id, EvalTrigger::NodeUpdate)?;
        let eval_ids = ids(&evals);
        let index = self.inner.state.apply(Command::UpdateNodeStatus {
            node_id: node_id.to_string(),
            status: NodeStatus::Down,
            event: Some(NodeEvent::new(
                NODE_EVENT_SUBSYSTEM_CLUSTER,
                NODE_EVENT_DEREGISTERED,
            )),
            evals: evals.clone(),
        })?;
        self.inner.heartbeat.clear(node_id).await;
        self.inner.dispatch.enqueue(evals, index);
        info!(%node_id, index, "node deregistered");

        Ok(NodeUpdateResponse {
            index,
            heartbeat_ttl_ms: 0,
            eval_ids,
        })
    }

    /// Renew a node's lease. A node that had been marked down comes back as
    /// ready.
    pub async fn heartbeat(&self, node_id: &str) -> ServerResult<HeartbeatResponse> {
        self.ensure_leader()?;
        let node = self.node_or_not_found(node_id)?;

        let mut index = None;
        if matches!(node.status, NodeStatus::Down | NodeStatus::Disconnected) {
            let revived = self.inner.state.apply(Command::UpdateNodeStatus {
                node_id: node_id.to_string(),
                status: NodeStatus::Ready,
                event: Some(NodeEvent::new(
                    NODE_EVENT_SUBSYSTEM_CLUSTER,
                    NODE_EVENT_REREGISTERED,
                )),
                evals: Vec::new(),
            })?;
            info!(%node_id, index = revived, "node heartbeat resumed");
            if !node.is_draining() {
                self.inner.dispatch.unblock(revived)?;
            }
            index = Some(revived);
        }

        let ttl = self.inner.heartbeat.renew(node_id).await?;
        Ok(HeartbeatResponse {
            heartbeat_ttl_ms: ttl.as_millis() as u64,
            index,
        })
    }

    /// Client-reported status change.
    pub async fn update_node_status(
        &self,
        node_id: &str,
        status: NodeStatus,
    ) -> ServerResult<NodeUpdateResponse> {
        self.ensure_leader()?;
        let node = self.node_or_not_found(node_id)?;
        if status == NodeStatus::Initializing && node.status != NodeStatus::Initializing {
            return Err(ServerError::invalid(format!(
                "node {node_id} cannot move from {} back to initializing",
                node.status
            )));
        }
        if node.status == status {
            let ttl = self.renew_unless_down(node_id, status).await?;
            return Ok(NodeUpdateResponse {
                index: node.modify_index,
                heartbeat_ttl_ms: ttl,
                eval_ids: Vec::new(),
            });
        }

        let evals = match status {
            NodeStatus::Down | NodeStatus::Disconnected => self
                .inner
                .dispatch
                .node_evals(node_id, EvalTrigger::NodeUpdate)?,
            _ => Vec::new(),
        };
        let eval_ids = ids(&evals);
        let index = self.inner.state.apply(Command::UpdateNodeStatus {
            node_id: node_id.to_string(),
            status,
            event: None,
            evals: evals.clone(),
        })?;
        self.inner.dispatch.enqueue(evals, index);
        if status == NodeStatus::Ready && !node.is_draining() {
            self.inner.dispatch.unblock(index)?;
        }
        let ttl = self.renew_unless_down(node_id, status).await?;
        info!(%node_id, from = %node.status, to = %status, index, "node status updated");

        Ok(NodeUpdateResponse {
            index,
            heartbeat_ttl_ms: ttl,
            eval_ids,
        })
    }

    /// Toggle drain. Draining nodes take no new placements and their
    /// allocations are migrated by the next evaluation of each job.
    pub async fn update_drain(&self, node_id: &str, enable: bool) -> ServerResult<NodeUpdateResponse> {
        self.ensure_leader()?;
        let node = self.node_or_not_found(node_id)?;

        let (eligibility, message) = if enable {
            (SchedulingEligibility::Ineligible, NODE_EVENT_DRAIN_ENABLED)
        } else {
            (SchedulingEligibility::Eligible, NODE_EVENT_DRAIN_DISABLED)
        };
        let evals = if enable {
            self.inner.dispatch.node_evals(node_id, EvalTrigger::NodeDrain)?
        } else {
            Vec::new()
        };
        let eval_ids = ids(&evals);
        let index = self.inner.state.apply(Command::UpdateNodeEligibility {
            node_id: node_id.to_string(),
            eligibility,
            event: Some(NodeEvent::new(NODE_EVENT_SUBSYSTEM_DRAIN, message)),
            evals: evals.clone(),
        })?;
        self.inner.dispatch.enqueue(evals, index);
        if !enable && node.status == NodeStatus::Ready {
            self.inner.dispatch.unblock(index)?;
        }
        info!(%node_id, enable, index, "node drain updated");

        Ok(NodeUpdateResponse {
            index,
            heartbeat_ttl_ms: 0,
            eval_ids,
        })
    }

    /// Record client-reported allocation statuses. Failed allocations get
    /// their job re-evaluated; any terminal status frees capacity.
    pub async fn update_allocs(&self, updates: Vec<AllocClientUpdate>) -> ServerResult<u64> {
        self.ensure_leader()?;
        if updates.is_empty() {
            return Err(ServerError::invalid("must update at least one allocation"));
        }

        let mut failed: BTreeMap<String, Allocation> = BTreeMap::new();
        let mut frees = false;
        for update in &updates {
            let alloc = self
                .inner
                .state
                .get_alloc(&update.alloc_id)?
                .ok_or_else(|| ServerError::NotFound(format!("allocation {}", update.alloc_id)))?;
            if update.client_status.is_terminal() && !alloc.client_status.is_terminal() {
                frees = true;
            }
            if update.client_status == AllocClientStatus::Failed {
                failed.entry(alloc.job_key().to_string()).or_insert(alloc);
            }
        }

        let mut evals = Vec::with_capacity(failed.len());
        for alloc in failed.values() {
            let priority = self
                .inner
                .state
                .get_job(&alloc.namespace, &alloc.job_id)?
                .map(|j| j.priority)
                .unwrap_or(corral_state::JOB_DEFAULT_PRIORITY);
            evals.push(Evaluation::new(
                &alloc.namespace,
                &alloc.job_id,
                priority,
                EvalTrigger::AllocFailure,
            ));
        }

        let count = updates.len();
        let index = self.inner.state.apply(Command::UpdateAllocsFromClient {
            updates,
            evals: evals.clone(),
        })?;
        self.inner.dispatch.enqueue(evals, index);
        if frees {
            self.inner.dispatch.unblock(index)?;
        }
        debug!(count, index, "allocation client updates applied");
        Ok(index)
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get_node(&self, node_id: &str) -> ServerResult<Node> {
        self.node_or_not_found(node_id)
    }

    pub fn list_nodes(&self) -> ServerResult<Vec<Node>> {
        Ok(self.inner.state.list_nodes()?)
    }

    pub fn node_allocations(&self, node_id: &str) -> ServerResult<Vec<Allocation>> {
        self.node_or_not_found(node_id)?;
        Ok(self.inner.state.allocs_by_node(node_id)?)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn node_or_not_found(&self, node_id: &str) -> ServerResult<Node> {
        self.inner
            .state
            .get_node(node_id)?
            .ok_or_else(|| ServerError::NotFound(format!("node {node_id}")))
    }

    fn commit_node_evals(&self, node_id: &str, trigger: EvalTrigger) -> ServerResult<Vec<String>> {
        let evals = self.inner.dispatch.node_evals(node_id, trigger)?;
        if evals.is_empty() {
            return Ok(Vec::new());
        }
        let eval_ids = ids(&evals);
        let index = self.inner.state.apply(Command::UpsertEvals {
            evals: evals.clone(),
        })?;
        self.inner.dispatch.enqueue(evals, index);
        Ok(eval_ids)
    }

    async fn renew_unless_down(&self, node_id: &str, status: NodeStatus) -> ServerResult<u64> {
        if status.is_terminal() {
            self.inner.heartbeat.clear(node_id).await;
            return Ok(0);
        }
        let ttl = self.inner.heartbeat.renew(node_id).await?;
        Ok(ttl.as_millis() as u64)
    }
}

fn ids(evals: &[Evaluation]) -> Vec<String> {
    evals.iter().map(|e| e.id.clone()).collect()
}
