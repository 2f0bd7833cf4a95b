//! Blocked evaluation tracker.
//!
//! Evaluations whose placements failed for lack of capacity are committed
//! as `blocked` and parked here, one per job. When capacity may have
//! changed the leader unblocks them: each comes back as a pending
//! evaluation pinned to the index of the change that freed capacity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use corral_core::LeaderEpoch;
use corral_state::{EvalStatus, Evaluation, JobKey};

#[derive(Default)]
struct BlockedState {
    epoch: Option<LeaderEpoch>,
    by_job: HashMap<JobKey, Evaluation>,
    /// Index of the most recent capacity change.
    unblock_index: u64,
    /// Replaced or untracked evaluations the leader should cancel.
    duplicates: Vec<Evaluation>,
}

#[derive(Clone, Default)]
pub struct BlockedEvals {
    state: Arc<Mutex<BlockedState>>,
}

impl BlockedEvals {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BlockedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self, epoch: LeaderEpoch) {
        let mut state = self.lock();
        *state = BlockedState::default();
        state.epoch = Some(epoch);
    }

    pub fn stop(&self) {
        *self.lock() = BlockedState::default();
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().epoch.is_some()
    }

    /// Track a blocked evaluation. A job keeps only its newest one; the
    /// one it replaces is queued for cancellation.
    ///
    /// If capacity already changed after the evaluation's snapshot, it is
    /// handed straight back as pending work instead of being parked.
    pub fn block(&self, eval: Evaluation) -> Option<Evaluation> {
        let mut state = self.lock();
        if state.epoch.is_none() {
            return None;
        }
        let job = eval.job_key();
        if state.unblock_index > eval.snapshot_index {
            debug!(eval_id = %eval.id, %job, "capacity changed since snapshot, releasing");
            let index = state.unblock_index;
            return Some(release(eval, index));
        }
        debug!(eval_id = %eval.id, %job, "tracking blocked evaluation");
        if let Some(old) = state.by_job.insert(job, eval) {
            state.duplicates.push(cancel(old, "superseded by a newer blocked evaluation"));
        }
        None
    }

    /// Drop a job's blocked evaluation once a later evaluation placed
    /// everything. The dropped evaluation is queued for cancellation.
    pub fn untrack(&self, job: &JobKey) {
        let mut state = self.lock();
        if let Some(old) = state.by_job.remove(job) {
            debug!(eval_id = %old.id, %job, "untracking blocked evaluation");
            state
                .duplicates
                .push(cancel(old, "job placed by a later evaluation"));
        }
    }

    /// Release every blocked evaluation as pending work at `index`.
    pub fn unblock(&self, index: u64) -> Vec<Evaluation> {
        let mut state = self.lock();
        if state.epoch.is_none() {
            return Vec::new();
        }
        state.unblock_index = state.unblock_index.max(index);
        if state.by_job.is_empty() {
            return Vec::new();
        }
        let released: Vec<Evaluation> = state
            .by_job
            .drain()
            .map(|(_, eval)| release(eval, index))
            .collect();
        info!(index, count = released.len(), "unblocked evaluations");
        released
    }

    pub fn take_duplicates(&self) -> Vec<Evaluation> {
        std::mem::take(&mut self.lock().duplicates)
    }

    pub fn len(&self) -> usize {
        self.lock().by_job.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, job: &JobKey) -> Option<Evaluation> {
        self.lock().by_job.get(job).cloned()
    }
}

fn release(mut eval: Evaluation, index: u64) -> Evaluation {
    eval.status = EvalStatus::Pending;
    eval.status_description = format!("unblocked at index {index}");
    eval.snapshot_index = eval.snapshot_index.max(index);
    eval
}

fn cancel(mut eval: Evaluation, reason: &str) -> Evaluation {
    eval.status = EvalStatus::Canceled;
    eval.status_description = reason.to_string();
    eval
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_state::EvalTrigger;

    fn blocked_eval(job: &str, snapshot_index: u64) -> Evaluation {
        let mut eval = Evaluation::new("default", job, 50, EvalTrigger::QueuedAllocs);
        eval.status = EvalStatus::Blocked;
        eval.snapshot_index = snapshot_index;
        eval
    }

    #[test]
    fn ignored_until_started() {
        let blocked = BlockedEvals::new();
        assert!(blocked.block(blocked_eval("web", 1)).is_none());
        assert!(blocked.is_empty());
    }

    #[test]
    fn one_per_job_newest_wins() {
        let blocked = BlockedEvals::new();
        blocked.start(LeaderEpoch::new(1));
        let old = blocked_eval("web", 1);
        let new = blocked_eval("web", 2);
        assert!(blocked.block(old.clone()).is_none());
        assert!(blocked.block(new.clone()).is_none());
        assert!(blocked.block(blocked_eval("api", 3)).is_none());

        assert_eq!(blocked.len(), 2);
        assert_eq!(blocked.get(&JobKey::new("default", "web")).unwrap().id, new.id);
        let dups = blocked.take_duplicates();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].id, old.id);
        assert_eq!(dups[0].status, EvalStatus::Canceled);
    }

    #[test]
    fn unblock_releases_pending_at_index() {
        let blocked = BlockedEvals::new();
        blocked.start(LeaderEpoch::new(1));
        let _ = blocked.block(blocked_eval("web", 5));
        let _ = blocked.block(blocked_eval("api", 50));

        let mut released = blocked.unblock(10);
        released.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        assert_eq!(released.len(), 2);
        assert!(released.iter().all(|e| e.status == EvalStatus::Pending));
        assert_eq!(released[0].snapshot_index, 50);
        assert_eq!(released[1].snapshot_index, 10);
        assert!(blocked.is_empty());
        assert!(blocked.unblock(11).is_empty());
    }

    #[test]
    fn block_after_capacity_change_releases_immediately() {
        let blocked = BlockedEvals::new();
        blocked.start(LeaderEpoch::new(1));
        assert!(blocked.unblock(20).is_empty());

        let stale = blocked.block(blocked_eval("web", 15)).unwrap();
        assert_eq!(stale.status, EvalStatus::Pending);
        assert_eq!(stale.snapshot_index, 20);
        assert!(blocked.is_empty());

        assert!(blocked.block(blocked_eval("web", 20)).is_none());
        assert_eq!(blocked.len(), 1);
    }

    #[test]
    fn untrack_cancels_and_stop_clears() {
        let blocked = BlockedEvals::new();
        blocked.start(LeaderEpoch::new(1));
        let _ = blocked.block(blocked_eval("web", 1));
        blocked.untrack(&JobKey::new("default", "web"));
        assert!(blocked.is_empty());
        assert_eq!(blocked.take_duplicates().len(), 1);

        let _ = blocked.block(blocked_eval("api", 1));
        blocked.stop();
        assert!(blocked.is_empty());
        assert!(!blocked.is_enabled());
    }
}
