//! Placement engine — picks a node for each instance of a task group.
//!
//! The [`Allocator`] walks every node in the job's pool, filters it through
//! readiness, constraints, distinct-host/property rules, and host volume
//! claims, scores the survivors with best-fit bin-packing, and takes the
//! best one. Choices are remembered for the rest of the plan so later
//! instances see the capacity and claims earlier ones consumed.

use std::collections::HashSet;

use corral_state::{
    AllocId, AllocMetric, Allocation, Constraint, ConstraintOperand, Job, JobKey, Node, NodeId,
    Resources, StateSnapshot, TaskGroup, VolumeClaim,
};
use tracing::{debug, warn};

use crate::convert::node_usage;
use crate::feasible::{
    FILTER_DISTINCT_HOSTS, FILTER_DISTINCT_PROPERTY, FILTER_MISSING_PROPERTY, check_node_ready,
    RegexCache, first_failed_constraint, resolve_target,
};
use crate::scorer::{NodeScore, compare_scores, score_node};
use crate::volumes::select_claims;

/// A chosen node for one named instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub name: String,
    pub node_id: NodeId,
    pub resources: Resources,
    pub volume_claims: Vec<VolumeClaim>,
    pub score: f64,
}

/// Result of placing one task group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupPlacement {
    pub placed: Vec<Placement>,
    /// Why the remaining instances could not be placed.
    pub failed: Option<AllocMetric>,
}

impl GroupPlacement {
    pub fn unplaced(&self) -> u32 {
        self.failed
            .as_ref()
            .map_or(0, |m| m.coalesced_failures + 1)
    }
}

/// What the plan in progress has already proposed.
#[derive(Debug, Clone)]
struct Proposed {
    job: JobKey,
    task_group: String,
    node_id: NodeId,
    resources: Resources,
    claims: Vec<VolumeClaim>,
}

/// Computes placements against one snapshot, with a plan-local overlay.
pub struct Allocator<'a> {
    snapshot: &'a StateSnapshot,
    stopping: HashSet<AllocId>,
    proposed: Vec<Proposed>,
    regexes: RegexCache,
}

impl<'a> Allocator<'a> {
    pub fn new(snapshot: &'a StateSnapshot) -> Self {
        Self {
            snapshot,
            stopping: HashSet::new(),
            proposed: Vec::new(),
            regexes: RegexCache::new(),
        }
    }

    /// Treat an allocation as gone: its capacity and claims are free for
    /// the rest of the plan.
    pub fn stopping(&mut self, alloc_id: &str) {
        self.stopping.insert(alloc_id.to_string());
    }

    /// Place one instance per name. Stops at the first failure; the
    /// remaining names are counted as coalesced failures.
    pub fn place(&mut self, job: &Job, group: &TaskGroup, names: &[String]) -> GroupPlacement {
        let mut result = GroupPlacement::default();

        for (i, name) in names.iter().enumerate() {
            match self.select(job, group) {
                Ok((score, claims)) => {
                    debug!(
                        job = %job.id,
                        group = %group.name,
                        %name,
                        node_id = %score.node_id,
                        score = score.score,
                        "instance placed"
                    );
                    self.proposed.push(Proposed {
                        job: job.key(),
                        task_group: group.name.clone(),
                        node_id: score.node_id.clone(),
                        resources: group.resources,
                        claims: claims.clone(),
                    });
                    result.placed.push(Placement {
                        name: name.clone(),
                        node_id: score.node_id,
                        resources: group.resources,
                        volume_claims: claims,
                        score: score.score,
                    });
                }
                Err(mut metric) => {
                    metric.coalesced_failures = (names.len() - i - 1) as u32;
                    warn!(
                        job = %job.id,
                        group = %group.name,
                        unplaced = names.len() - i,
                        evaluated = metric.nodes_evaluated,
                        filtered = metric.nodes_filtered,
                        exhausted = metric.nodes_exhausted,
                        "placement failed"
                    );
                    result.failed = Some(metric);
                    break;
                }
            }
        }

        result
    }

    fn select(
        &self,
        job: &Job,
        group: &TaskGroup,
    ) -> Result<(NodeScore, Vec<VolumeClaim>), AllocMetric> {
        let mut metric = AllocMetric::default();
        let mut best: Option<(NodeScore, Vec<VolumeClaim>)> = None;

        for node in self.snapshot.nodes_in_pool(&job.node_pool) {
            metric.nodes_in_pool += 1;
            metric.nodes_evaluated += 1;

            if let Err(reason) = self.check_feasible(node, job, group) {
                metric.filter_node(&reason);
                continue;
            }

            let claims = match select_claims(
                self.snapshot,
                node,
                &job.namespace,
                &group.volumes,
                |volume_id| self.held_claims(volume_id),
            ) {
                Ok(claims) => claims,
                Err(reason) => {
                    metric.filter_node(reason);
                    continue;
                }
            };

            let usage = node_usage(
                self.snapshot,
                node,
                &self.stopping,
                self.proposed
                    .iter()
                    .filter(|p| p.node_id == node.id)
                    .map(|p| &p.resources),
            );
            match score_node(&usage, &group.resources) {
                Ok(score) => {
                    let better = best
                        .as_ref()
                        .is_none_or(|(b, _)| compare_scores(&score, b).is_lt());
                    if better {
                        best = Some((score, claims));
                    }
                }
                Err(dimension) => metric.exhausted_node(dimension),
            }
        }

        best.ok_or(metric)
    }

    fn check_feasible(&self, node: &Node, job: &Job, group: &TaskGroup) -> Result<(), String> {
        check_node_ready(node).map_err(str::to_string)?;

        let single_node = job
            .constraints
            .iter()
            .chain(group.constraints.iter())
            .filter(|c| {
                !matches!(
                    c.operand,
                    ConstraintOperand::DistinctHosts | ConstraintOperand::DistinctProperty
                )
            });
        if let Some(failed) = first_failed_constraint(single_node, node, &self.regexes) {
            return Err(failed);
        }

        for c in &job.constraints {
            self.check_distinct(c, node, job, None)?;
        }
        for c in &group.constraints {
            self.check_distinct(c, node, job, Some(&group.name))?;
        }
        Ok(())
    }

    /// `distinct_hosts` / `distinct_property`, scoped to the whole job or to
    /// one task group.
    fn check_distinct(
        &self,
        constraint: &Constraint,
        node: &Node,
        job: &Job,
        group: Option<&str>,
    ) -> Result<(), String> {
        match constraint.operand {
            ConstraintOperand::DistinctHosts => {
                if self.job_nodes(job, group).iter().any(|n| n == &node.id) {
                    return Err(FILTER_DISTINCT_HOSTS.to_string());
                }
            }
            ConstraintOperand::DistinctProperty => {
                let Some(value) = resolve_target(&constraint.l_target, node) else {
                    return Err(format!("{FILTER_MISSING_PROPERTY} {}", constraint.l_target));
                };
                let limit: usize = constraint.r_target.parse().unwrap_or(1);
                let used = self
                    .job_nodes(job, group)
                    .iter()
                    .filter_map(|id| self.snapshot.node_by_id(id))
                    .filter(|n| resolve_target(&constraint.l_target, n).as_deref() == Some(&value))
                    .count();
                if used >= limit {
                    return Err(FILTER_DISTINCT_PROPERTY.to_string());
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Node of every live instance of the job (optionally one group),
    /// existing and proposed. One entry per instance.
    fn job_nodes(&self, job: &Job, group: Option<&str>) -> Vec<NodeId> {
        let key = job.key();
        let existing = self
            .snapshot
            .allocs_by_job(&job.namespace, &job.id)
            .into_iter()
            .filter(|a| !a.is_terminal() && !self.stopping.contains(&a.id))
            .filter(|a| group.is_none_or(|g| a.task_group == g))
            .map(|a| a.node_id.clone());
        let proposed = self
            .proposed
            .iter()
            .filter(|p| p.job == key)
            .filter(|p| group.is_none_or(|g| p.task_group == g))
            .map(|p| p.node_id.clone());
        existing.chain(proposed).collect()
    }

    /// Claims on a volume held by live allocations or proposed earlier in
    /// this plan.
    fn held_claims(&self, volume_id: &str) -> Vec<VolumeClaim> {
        let existing = self
            .snapshot
            .volume_claims(volume_id)
            .into_iter()
            .filter(|a| !self.stopping.contains(&a.id))
            .flat_map(|a: &Allocation| a.volume_claims.iter())
            .filter(|c| c.volume_id == volume_id)
            .cloned();
        let proposed = self
            .proposed
            .iter()
            .flat_map(|p| p.claims.iter())
            .filter(|c| c.volume_id == volume_id)
            .cloned();
        existing.chain(proposed).collect()
    }
}
