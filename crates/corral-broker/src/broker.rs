//! Evaluation broker — the leader's work queue for scheduler workers.
//!
//! Evaluations are delivered highest priority first, FIFO within a
//! priority. A job has at most one evaluation in flight (ready or leased);
//! anything else enqueued for that job waits in a single per-job slot,
//! merging with whatever is already waiting there.
//!
//! ```text
//!  enqueue ──► job in flight? ──yes──► waiting[job] (merge, loser canceled)
//!                  │ no                      │
//!                  ▼                         │ ack / final nack
//!               ready heap ◄─────────────────┘
//!                  │ dequeue
//!                  ▼
//!               unacked (token, lease timer) ──ack──► done
//!                  │ nack / lease expiry
//!                  ▼
//!          delivery limit reached? ──yes──► failed
//!                  │ no
//!                  └──────► ready heap
//! ```

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use corral_core::{BrokerConfig, LeaderEpoch};
use corral_state::{EvalId, EvalStatus, Evaluation, JobKey};

use crate::error::{BrokerError, BrokerResult};

/// A leased evaluation handed to a worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub eval: Evaluation,
    /// Must accompany the matching `ack` / `nack`.
    pub token: String,
}

/// Where an evaluation sits inside the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalState {
    Ready,
    Unacked,
    /// Queued behind another evaluation of the same job.
    Waiting,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub total_ready: usize,
    pub total_unacked: usize,
    pub total_waiting: usize,
    pub total_failed: usize,
    pub total_canceled: usize,
}

#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    priority: u8,
    seq: u64,
    eval_id: EvalId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Lease {
    token: String,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct BrokerState {
    epoch: Option<LeaderEpoch>,
    seq: u64,
    ready: BinaryHeap<ReadyEntry>,
    /// Ready or leased evaluations.
    evals: HashMap<EvalId, Evaluation>,
    unacked: HashMap<EvalId, Lease>,
    /// Job → the evaluation it has in flight.
    in_flight: HashMap<JobKey, EvalId>,
    waiting: HashMap<JobKey, Evaluation>,
    deliveries: HashMap<EvalId, u32>,
    failed: Vec<Evaluation>,
    canceled: Vec<Evaluation>,
}

impl BrokerState {
    fn push_ready(&mut self, eval: Evaluation) {
        self.seq += 1;
        self.in_flight.insert(eval.job_key(), eval.id.clone());
        self.ready.push(ReadyEntry {
            priority: eval.priority,
            seq: self.seq,
            eval_id: eval.id.clone(),
        });
        self.evals.insert(eval.id.clone(), eval);
    }

    /// Release the job's in-flight slot and promote whatever waits behind it.
    fn release_job(&mut self, job: &JobKey) {
        self.in_flight.remove(job);
        if let Some(next) = self.waiting.remove(job) {
            debug!(eval_id = %next.id, job = %job, "promoting waiting evaluation");
            self.push_ready(next);
        }
    }

    fn contains(&self, eval_id: &str) -> bool {
        self.evals.contains_key(eval_id) || self.waiting.values().any(|e| e.id == eval_id)
    }

    fn reset(&mut self) {
        for (_, lease) in self.unacked.drain() {
            lease.timer.abort();
        }
        *self = BrokerState::default();
    }
}

/// Merge `incoming` into the job's waiting slot. Returns the evaluation
/// that lost: the lower priority one, or the older one on a tie.
fn merge_waiting(current: Evaluation, incoming: Evaluation) -> (Evaluation, Evaluation) {
    let snapshot_index = current.snapshot_index.max(incoming.snapshot_index);
    let (mut winner, loser) = if incoming.priority >= current.priority {
        (incoming, current)
    } else {
        (current, incoming)
    };
    winner.snapshot_index = snapshot_index;
    (winner, loser)
}

/// Leader-only evaluation queue. Cheap to clone.
#[derive(Clone)]
pub struct EvalBroker {
    config: BrokerConfig,
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl EvalBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(BrokerState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin accepting work for a leadership term. Any previous state is
    /// discarded.
    pub fn start(&self, epoch: LeaderEpoch) {
        let mut state = self.lock();
        state.reset();
        state.epoch = Some(epoch);
        info!(%epoch, "eval broker enabled");
    }

    /// Discard all queued and leased work and wake blocked dequeuers.
    pub fn stop(&self) {
        let epoch = {
            let mut state = self.lock();
            let epoch = state.epoch.take();
            state.reset();
            epoch
        };
        self.notify.notify_waiters();
        if let Some(epoch) = epoch {
            info!(%epoch, "eval broker disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().epoch.is_some()
    }

    /// Queue an evaluation. Re-enqueueing a known evaluation ID is a no-op.
    pub fn enqueue(&self, mut eval: Evaluation) -> BrokerResult<()> {
        {
            let mut state = self.lock();
            if state.epoch.is_none() {
                return Err(BrokerError::NotLeader);
            }
            if state.contains(&eval.id) {
                debug!(eval_id = %eval.id, "evaluation already queued");
                return Ok(());
            }

            let job = eval.job_key();
            if state.in_flight.contains_key(&job) {
                eval.status = EvalStatus::Blocked;
                let kept = match state.waiting.remove(&job) {
                    Some(current) => {
                        let (winner, mut loser) = merge_waiting(current, eval);
                        debug!(
                            kept = %winner.id,
                            canceled = %loser.id,
                            job = %job,
                            "merged waiting evaluations"
                        );
                        loser.status = EvalStatus::Canceled;
                        loser.status_description =
                            format!("superseded by evaluation {}", winner.id);
                        state.canceled.push(loser);
                        winner
                    }
                    None => eval,
                };
                debug!(eval_id = %kept.id, job = %job, "evaluation waiting on in-flight job");
                state.waiting.insert(job, kept);
                return Ok(());
            }

            eval.status = EvalStatus::Pending;
            debug!(eval_id = %eval.id, priority = eval.priority, "evaluation enqueued");
            state.push_ready(eval);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Wait up to `timeout` for the highest priority ready evaluation.
    pub async fn dequeue(&self, worker_id: &str, timeout: Duration) -> BrokerResult<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_dequeue(worker_id)? {
                return Ok(Some(delivery));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    fn try_dequeue(&self, worker_id: &str) -> BrokerResult<Option<Delivery>> {
        let mut state = self.lock();
        if state.epoch.is_none() {
            return Err(BrokerError::NotLeader);
        }
        let Some(entry) = state.ready.pop() else {
            return Ok(None);
        };
        let Some(mut eval) = state.evals.get(&entry.eval_id).cloned() else {
            return Ok(None);
        };

        let token = uuid::Uuid::new_v4().to_string();
        let timer = self.spawn_lease_timer(&eval.id, &token);
        state.unacked.insert(
            eval.id.clone(),
            Lease {
                token: token.clone(),
                timer,
            },
        );
        *state.deliveries.entry(eval.id.clone()).or_default() += 1;

        eval.status = EvalStatus::Running;
        debug!(eval_id = %eval.id, %worker_id, "evaluation dequeued");
        Ok(Some(Delivery { eval, token }))
    }

    fn spawn_lease_timer(&self, eval_id: &str, token: &str) -> JoinHandle<()> {
        let broker = self.clone();
        let eval_id = eval_id.to_string();
        let token = token.to_string();
        let after = self.config.nack_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            warn!(%eval_id, "evaluation lease expired");
            if let Err(e) = broker.nack(&eval_id, &token) {
                debug!(%eval_id, error = %e, "lease expiry raced with ack");
            }
        })
    }

    /// Complete a leased evaluation and release the job.
    pub fn ack(&self, eval_id: &str, token: &str) -> BrokerResult<()> {
        {
            let mut state = self.lock();
            check_lease(&state, eval_id, token)?;
            if let Some(lease) = state.unacked.remove(eval_id) {
                lease.timer.abort();
            }
            state.deliveries.remove(eval_id);
            if let Some(eval) = state.evals.remove(eval_id) {
                state.release_job(&eval.job_key());
            }
            debug!(%eval_id, "evaluation acked");
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Return a leased evaluation for redelivery. After the delivery limit
    /// it moves to the failed set instead.
    pub fn nack(&self, eval_id: &str, token: &str) -> BrokerResult<()> {
        {
            let mut state = self.lock();
            check_lease(&state, eval_id, token)?;
            if let Some(lease) = state.unacked.remove(eval_id) {
                lease.timer.abort();
            }
            let Some(mut eval) = state.evals.remove(eval_id) else {
                return Err(BrokerError::NotOutstanding(eval_id.to_string()));
            };

            let deliveries = state.deliveries.get(eval_id).copied().unwrap_or(0);
            if deliveries >= self.config.eval_delivery_limit {
                warn!(%eval_id, deliveries, "evaluation reached delivery limit");
                state.deliveries.remove(eval_id);
                eval.status = EvalStatus::Failed;
                eval.status_description = format!(
                    "evaluation reached delivery limit ({})",
                    self.config.eval_delivery_limit
                );
                let job = eval.job_key();
                state.failed.push(eval);
                state.release_job(&job);
            } else {
                debug!(%eval_id, deliveries, "evaluation nacked, requeued");
                state.push_ready(eval);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Evaluations that hit the delivery limit since the last call.
    pub fn take_failed(&self) -> Vec<Evaluation> {
        std::mem::take(&mut self.lock().failed)
    }

    /// Evaluations superseded by a merge since the last call.
    pub fn take_canceled(&self) -> Vec<Evaluation> {
        std::mem::take(&mut self.lock().canceled)
    }

    pub fn eval_state(&self, eval_id: &str) -> Option<EvalState> {
        let state = self.lock();
        if state.unacked.contains_key(eval_id) {
            Some(EvalState::Unacked)
        } else if state.evals.contains_key(eval_id) {
            Some(EvalState::Ready)
        } else if state.waiting.values().any(|e| e.id == eval_id) {
            Some(EvalState::Waiting)
        } else {
            None
        }
    }

    pub fn stats(&self) -> BrokerStats {
        let state = self.lock();
        BrokerStats {
            total_ready: state.ready.len(),
            total_unacked: state.unacked.len(),
            total_waiting: state.waiting.len(),
            total_failed: state.failed.len(),
            total_canceled: state.canceled.len(),
        }
    }
}

fn check_lease(state: &BrokerState, eval_id: &str, token: &str) -> BrokerResult<()> {
    if state.epoch.is_none() {
        return Err(BrokerError::NotLeader);
    }
    match state.unacked.get(eval_id) {
        None => Err(BrokerError::NotOutstanding(eval_id.to_string())),
        Some(lease) if lease.token != token => Err(BrokerError::TokenMismatch(eval_id.to_string())),
        Some(_) => Ok(()),
    }
}
