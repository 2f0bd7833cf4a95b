//! Generic service scheduler — reconciles a job against its allocations.
//!
//! Given one evaluation and a snapshot, works out what the job should look
//! like and what it looks like now:
//!
//! 1. job gone or stopped → stop every live allocation
//! 2. task group removed → stop its allocations
//! 3. node down or disconnected → allocation is lost, replace it
//! 4. node draining → migrate (stop and replace)
//! 5. more instances than `count` → stop the highest name indexes
//! 6. fewer → place the lowest free name indexes
//!
//! Stops are registered with the [`Allocator`] before any placement so the
//! capacity and volume claims they free are usable in the same plan.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use corral_placement::Allocator;
use corral_state::{
    AllocClientStatus, AllocDesiredStatus, AllocMetric, Allocation, Evaluation, Job, NodeStatus,
    Plan, StateSnapshot, TaskGroup, generate_id,
};

pub const DESC_JOB_STOPPED: &str = "alloc not needed since job is stopped";
pub const DESC_GROUP_REMOVED: &str = "alloc not needed since task group was removed";
pub const DESC_NODE_LOST: &str = "alloc is lost since its node is down";
pub const DESC_MIGRATING: &str = "alloc is being migrated off a draining node";
pub const DESC_SCALE_DOWN: &str = "alloc not needed due to scale down";
pub const DESC_DUPLICATE: &str = "alloc is a duplicate of another instance";

/// What one evaluation decided.
#[derive(Debug, Clone)]
pub struct SchedulerOutput {
    pub plan: Plan,
    /// Task group → why its remaining placements failed.
    pub failed_tg_allocs: BTreeMap<String, AllocMetric>,
    /// Task group → placements still waiting for capacity.
    pub queued: BTreeMap<String, u32>,
}

/// Reconcile `eval`'s job against `snapshot`.
pub fn compute(snapshot: &StateSnapshot, eval: &Evaluation) -> SchedulerOutput {
    let mut output = SchedulerOutput {
        plan: Plan::for_eval(eval, snapshot.index()),
        failed_tg_allocs: BTreeMap::new(),
        queued: BTreeMap::new(),
    };

    let live: Vec<&Allocation> = snapshot
        .allocs_by_job(&eval.namespace, &eval.job_id)
        .into_iter()
        .filter(|a| !a.is_terminal())
        .collect();

    let job = match snapshot.job_by_id(&eval.namespace, &eval.job_id) {
        Some(job) if !job.stop => job,
        _ => {
            for alloc in live {
                output.plan.append_stopped_alloc(alloc, DESC_JOB_STOPPED, None);
            }
            return output;
        }
    };

    let mut allocator = Allocator::new(snapshot);
    // Group → name index → kept allocation.
    let mut kept: BTreeMap<&str, BTreeMap<u32, &Allocation>> = BTreeMap::new();

    for alloc in live {
        if job.lookup_task_group(&alloc.task_group).is_none() {
            stop(&mut output.plan, &mut allocator, alloc, DESC_GROUP_REMOVED, None);
            continue;
        }

        let node = snapshot.node_by_id(&alloc.node_id);
        let lost = node.is_none_or(|n| {
            matches!(n.status, NodeStatus::Down | NodeStatus::Disconnected)
        });
        if lost {
            stop(
                &mut output.plan,
                &mut allocator,
                alloc,
                DESC_NODE_LOST,
                Some(AllocClientStatus::Lost),
            );
            continue;
        }
        if node.is_some_and(|n| n.is_draining()) {
            stop(&mut output.plan, &mut allocator, alloc, DESC_MIGRATING, None);
            continue;
        }

        let slots = kept.entry(alloc.task_group.as_str()).or_default();
        match alloc.name_index() {
            Some(index) if !slots.contains_key(&index) => {
                slots.insert(index, alloc);
            }
            _ => stop(&mut output.plan, &mut allocator, alloc, DESC_DUPLICATE, None),
        }
    }

    for group in &job.task_groups {
        let slots = kept.remove(group.name.as_str()).unwrap_or_default();
        let count = group.count as usize;

        let excess = slots.len().saturating_sub(count);
        for (_, alloc) in slots.iter().rev().take(excess) {
            stop(&mut output.plan, &mut allocator, alloc, DESC_SCALE_DOWN, None);
        }

        let used: BTreeSet<u32> = slots.keys().copied().collect();
        let missing = count.saturating_sub(slots.len());
        if missing == 0 {
            continue;
        }
        let names: Vec<String> = (0..)
            .filter(|i| !used.contains(i))
            .take(missing)
            .map(|i| Allocation::alloc_name(&job.id, &group.name, i))
            .collect();

        place_group(&mut output, &mut allocator, job, group, eval, &names);
    }

    debug!(
        eval_id = %eval.id,
        placed = output.plan.placed_allocs().count(),
        stopped = output.plan.stopped_allocs().count(),
        failed_groups = output.failed_tg_allocs.len(),
        "evaluation reconciled"
    );
    output
}

fn stop(
    plan: &mut Plan,
    allocator: &mut Allocator<'_>,
    alloc: &Allocation,
    description: &str,
    client_status: Option<AllocClientStatus>,
) {
    plan.append_stopped_alloc(alloc, description, client_status);
    allocator.stopping(&alloc.id);
}

fn place_group(
    output: &mut SchedulerOutput,
    allocator: &mut Allocator<'_>,
    job: &Job,
    group: &TaskGroup,
    eval: &Evaluation,
    names: &[String],
) {
    let result = allocator.place(job, group, names);
    let unplaced = result.unplaced();
    for placement in result.placed {
        output.plan.append_alloc(Allocation {
            id: generate_id(),
            eval_id: eval.id.clone(),
            name: placement.name,
            namespace: job.namespace.clone(),
            job_id: job.id.clone(),
            task_group: group.name.clone(),
            node_id: placement.node_id,
            resources: placement.resources,
            volume_claims: placement.volume_claims,
            desired_status: AllocDesiredStatus::Run,
            desired_description: String::new(),
            client_status: AllocClientStatus::Pending,
            create_index: 0,
            modify_index: 0,
            create_time: 0,
            modify_time: 0,
        });
    }
    if let Some(metric) = result.failed {
        output.queued.insert(group.name.clone(), unplaced);
        output.failed_tg_allocs.insert(group.name.clone(), metric);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_state::{
        Command, EvalTrigger, JOB_DEFAULT_PRIORITY, Node, Resources, SchedulingEligibility,
        StateStore,
    };

    fn ready_node(state: &StateStore, id: &str, cpu: u64) {
        let mut node = Node::new(id, Resources::new(cpu, 4096));
        node.status = NodeStatus::Ready;
        state.apply(Command::UpsertNode { node }).unwrap();
    }

    fn job(count: u32) -> Job {
        Job {
            id: "web".to_string(),
            namespace: "default".to_string(),
            name: "web".to_string(),
            node_pool: "default".to_string(),
            priority: JOB_DEFAULT_PRIORITY,
            constraints: Vec::new(),
            task_groups: vec![TaskGroup {
                name: "app".to_string(),
                count,
                resources: Resources::new(500, 256),
                constraints: Vec::new(),
                volumes: BTreeMap::new(),
            }],
            stop: false,
            version: 0,
            create_index: 0,
            modify_index: 0,
            submit_time: 0,
        }
    }

    fn register(state: &StateStore, job: Job) -> Evaluation {
        let eval = Evaluation::for_job(&job, EvalTrigger::JobRegister);
        state
            .apply(Command::UpsertJob { job, eval: Some(eval.clone()), check_index: None })
            .unwrap();
        eval
    }

    /// Compute and commit, returning the output.
    fn run(state: &StateStore, eval: &Evaluation) -> SchedulerOutput {
        let snapshot = state.snapshot().unwrap();
        let output = compute(&snapshot, eval);
        if !output.plan.is_no_op() {
            state
                .apply(Command::ApplyPlan { plan: output.plan.clone() })
                .unwrap();
        }
        output
    }

    fn live_names(state: &StateStore) -> Vec<String> {
        let mut names: Vec<String> = state
            .allocs_by_job("default", "web")
            .unwrap()
            .into_iter()
            .filter(|a| !a.is_terminal())
            .map(|a| a.name)
            .collect();
        names.sort();
        names
    }

    #[test]
    fn places_missing_instances() {
        let state = StateStore::open_in_memory().unwrap();
        ready_node(&state, "n1", 4000);
        let eval = register(&state, job(3));

        let output = run(&state, &eval);
        assert_eq!(output.plan.placed_allocs().count(), 3);
        assert!(output.failed_tg_allocs.is_empty());
        assert_eq!(live_names(&state), vec!["web.app[0]", "web.app[1]", "web.app[2]"]);

        // Re-running is a no-op.
        let again = compute(&state.snapshot().unwrap(), &eval);
        assert!(again.plan.is_no_op());
    }

    #[test]
    fn scale_down_stops_highest_indexes() {
        let state = StateStore::open_in_memory().unwrap();
        ready_node(&state, "n1", 4000);
        run(&state, &register(&state, job(3)));

        let eval = register(&state, job(1));
        let output = run(&state, &eval);
        assert_eq!(output.plan.stopped_allocs().count(), 2);
        assert!(
            output
                .plan
                .stopped_allocs()
                .all(|a| a.desired_description == DESC_SCALE_DOWN)
        );
        assert_eq!(live_names(&state), vec!["web.app[0]"]);
    }

    #[test]
    fn stopped_job_stops_everything() {
        let state = StateStore::open_in_memory().unwrap();
        ready_node(&state, "n1", 4000);
        run(&state, &register(&state, job(2)));

        let mut stopped = job(2);
        stopped.stop = true;
        let eval = register(&state, stopped);
        let output = run(&state, &eval);
        assert_eq!(output.plan.stopped_allocs().count(), 2);
        assert!(output.plan.placed_allocs().next().is_none());
        assert!(live_names(&state).is_empty());
    }

    #[test]
    fn lost_allocations_are_replaced() {
        let state = StateStore::open_in_memory().unwrap();
        ready_node(&state, "n1", 4000);
        run(&state, &register(&state, job(1)));
        ready_node(&state, "n2", 4000);

        state
            .apply(Command::UpdateNodeStatus {
                node_id: "n1".to_string(),
                status: NodeStatus::Down,
                event: None,
                evals: Vec::new(),
            })
            .unwrap();

        let eval = Evaluation::new("default", "web", 50, EvalTrigger::NodeUpdate);
        let output = run(&state, &eval);
        let stopped: Vec<&Allocation> = output.plan.stopped_allocs().collect();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].client_status, AllocClientStatus::Lost);
        let placed: Vec<&Allocation> = output.plan.placed_allocs().collect();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].node_id, "n2");
        assert_eq!(placed[0].name, "web.app[0]");
    }

    #[test]
    fn draining_node_migrates() {
        let state = StateStore::open_in_memory().unwrap();
        ready_node(&state, "n1", 4000);
        run(&state, &register(&state, job(1)));
        ready_node(&state, "n2", 4000);
        state
            .apply(Command::UpdateNodeEligibility {
                node_id: "n1".to_string(),
                eligibility: SchedulingEligibility::Ineligible,
                event: None,
                evals: Vec::new(),
            })
            .unwrap();

        let eval = Evaluation::new("default", "web", 50, EvalTrigger::NodeDrain);
        let output = run(&state, &eval);
        let stopped: Vec<&Allocation> = output.plan.stopped_allocs().collect();
        assert_eq!(stopped[0].desired_description, DESC_MIGRATING);
        assert_eq!(output.plan.placed_allocs().next().unwrap().node_id, "n2");
    }

    #[test]
    fn insufficient_capacity_reports_queued() {
        let state = StateStore::open_in_memory().unwrap();
        ready_node(&state, "n1", 1000);
        let eval = register(&state, job(4));

        let output = run(&state, &eval);
        assert_eq!(output.plan.placed_allocs().count(), 2);
        assert_eq!(output.queued.get("app"), Some(&2));
        let metric = &output.failed_tg_allocs["app"];
        assert_eq!(metric.dimension_exhausted.get("cpu"), Some(&1));
        assert_eq!(metric.coalesced_failures, 1);
    }
}
