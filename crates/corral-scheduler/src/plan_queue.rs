//! Plan queue — funnels concurrently computed plans into one commit stream.
//!
//! Workers compute plans in parallel against their own snapshots. The
//! queue hands each plan to a single applier task, which commits it through
//! [`StateStore::apply`]. The store rejects a plan if any node or volume it
//! touches changed after the plan's snapshot index; that rejection comes
//! back to the worker as [`SchedulerError::StalePlan`] and the evaluation is
//! nacked for recomputation.
//!
//! ```text
//!   worker ─┐
//!   worker ─┼─► mpsc ─► applier task ─► StateStore::apply(ApplyPlan) ─► on_commit
//!   worker ─┘    ▲                            │
//!                └──── oneshot reply ◄────────┘
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use corral_core::LeaderEpoch;
use corral_state::{Command, Plan, PlanResult, StateError, StateStore};

use crate::error::{SchedulerError, SchedulerResult};

/// Invoked after every committed plan, on the applier task.
pub type PlanCommitCallback = Arc<dyn Fn(&Plan, &PlanResult) + Send + Sync>;

const QUEUE_DEPTH: usize = 256;

struct PendingPlan {
    plan: Plan,
    reply: oneshot::Sender<SchedulerResult<PlanResult>>,
}

struct Applier {
    epoch: LeaderEpoch,
    tx: mpsc::Sender<PendingPlan>,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct PlanQueue {
    state: StateStore,
    applier: Arc<Mutex<Option<Applier>>>,
    on_commit: Option<PlanCommitCallback>,
}

impl PlanQueue {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            applier: Arc::new(Mutex::new(None)),
            on_commit: None,
        }
    }

    /// Set a callback for committed plans.
    pub fn with_callback(mut self, callback: PlanCommitCallback) -> Self {
        self.on_commit = Some(callback);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Option<Applier>> {
        self.applier.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the applier for a leadership term.
    pub fn start(&self, epoch: LeaderEpoch) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let state = self.state.clone();
        let on_commit = self.on_commit.clone();
        let handle = tokio::spawn(run_applier(state, rx, on_commit, epoch));

        if let Some(old) = self.lock().replace(Applier { epoch, tx, handle }) {
            old.handle.abort();
        }
        info!(%epoch, "plan queue enabled");
    }

    /// Stop the applier. Queued and in-flight submissions fail with
    /// [`SchedulerError::NotLeader`].
    pub fn stop(&self) {
        if let Some(applier) = self.lock().take() {
            applier.handle.abort();
            info!(epoch = %applier.epoch, "plan queue disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().is_some()
    }

    /// Submit a plan and wait for the applier's verdict.
    pub async fn submit(&self, plan: Plan) -> SchedulerResult<PlanResult> {
        let tx = match self.lock().as_ref() {
            Some(applier) => applier.tx.clone(),
            None => return Err(SchedulerError::NotLeader),
        };

        let (reply, rx) = oneshot::channel();
        tx.send(PendingPlan { plan, reply })
            .await
            .map_err(|_| SchedulerError::NotLeader)?;
        rx.await.map_err(|_| SchedulerError::NotLeader)?
    }
}

async fn run_applier(
    state: StateStore,
    mut rx: mpsc::Receiver<PendingPlan>,
    on_commit: Option<PlanCommitCallback>,
    epoch: LeaderEpoch,
) {
    debug!(%epoch, "plan applier running");
    while let Some(pending) = rx.recv().await {
        let result = apply_plan(&state, pending.plan, on_commit.as_ref());
        // The submitter may have given up.
        let _ = pending.reply.send(result);
    }
    debug!(%epoch, "plan applier exiting");
}

fn apply_plan(
    state: &StateStore,
    plan: Plan,
    on_commit: Option<&PlanCommitCallback>,
) -> SchedulerResult<PlanResult> {
    if plan.is_no_op() {
        let index = state.latest_index()?;
        return Ok(PlanResult::from_plan(&plan, index));
    }

    match state.apply(Command::ApplyPlan { plan: plan.clone() }) {
        Ok(index) => {
            let result = PlanResult::from_plan(&plan, index);
            info!(
                eval_id = %plan.eval_id,
                index,
                placed = result.placed.len(),
                stopped = result.stopped.len(),
                "plan applied"
            );
            if let Some(callback) = on_commit {
                callback(&plan, &result);
            }
            Ok(result)
        }
        Err(StateError::StalePlan {
            entity,
            modify_index,
            snapshot_index,
        }) => {
            warn!(
                eval_id = %plan.eval_id,
                %entity,
                modify_index,
                snapshot_index,
                "plan rejected, snapshot is stale"
            );
            Err(SchedulerError::StalePlan(format!(
                "{entity} modified at index {modify_index}, after snapshot index {snapshot_index}"
            )))
        }
        Err(StateError::Conflict(reason)) => {
            warn!(eval_id = %plan.eval_id, %reason, "plan rejected");
            Err(SchedulerError::Rejected(reason))
        }
        Err(e) => Err(e.into()),
    }
}
