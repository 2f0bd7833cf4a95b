//! Scheduler workers — dequeue, snapshot, reconcile, submit, ack.
//!
//! Each worker is an independent task. The only suspension points are the
//! broker dequeue (bounded by `dequeue_timeout`) and the plan queue reply.
//! Any failure nacks the evaluation so the broker redelivers it against
//! fresh state.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use corral_broker::{BlockedEvals, BrokerError, Delivery, EvalBroker};
use corral_state::{Command, EvalStatus, Evaluation, StateStore};

use crate::error::{SchedulerError, SchedulerResult};
use crate::generic::{SchedulerOutput, compute};
use crate::plan_queue::PlanQueue;

/// Everything a worker needs. Cheap to clone.
#[derive(Clone)]
pub struct WorkerContext {
    pub state: StateStore,
    pub broker: EvalBroker,
    pub blocked: BlockedEvals,
    pub plans: PlanQueue,
    pub dequeue_timeout: Duration,
}

pub struct Worker {
    id: String,
    ctx: WorkerContext,
}

impl Worker {
    pub fn new(id: impl Into<String>, ctx: WorkerContext) -> Self {
        Self { id: id.into(), ctx }
    }

    /// Run until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, "scheduler worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                res = self.ctx.broker.dequeue(&self.id, self.ctx.dequeue_timeout) => match res {
                    Ok(Some(delivery)) => self.process(delivery).await,
                    Ok(None) => {}
                    Err(BrokerError::NotLeader) => {
                        tokio::time::sleep(self.ctx.dequeue_timeout).await;
                    }
                    Err(e) => warn!(worker_id = %self.id, error = %e, "dequeue failed"),
                },
            }
        }
        info!(worker_id = %self.id, "scheduler worker stopped");
    }

    /// Handle one delivery. Public so tests can drive a worker step by step.
    pub async fn process(&self, delivery: Delivery) {
        let Delivery { eval, token } = delivery;
        debug!(worker_id = %self.id, eval_id = %eval.id, job = %eval.job_id, "processing evaluation");

        match self.schedule(&eval).await {
            Ok(()) => {
                if let Err(e) = self.ctx.broker.ack(&eval.id, &token) {
                    warn!(eval_id = %eval.id, error = %e, "ack failed");
                }
            }
            Err(e) => {
                warn!(eval_id = %eval.id, error = %e, "evaluation failed, nacking");
                if let Err(e) = self.ctx.broker.nack(&eval.id, &token) {
                    warn!(eval_id = %eval.id, error = %e, "nack failed");
                }
            }
        }
    }

    async fn schedule(&self, eval: &Evaluation) -> SchedulerResult<()> {
        let snapshot = self.ctx.state.snapshot()?;
        if snapshot.index() < eval.snapshot_index {
            return Err(SchedulerError::StalePlan(format!(
                "snapshot index {} behind evaluation index {}",
                snapshot.index(),
                eval.snapshot_index
            )));
        }

        let output = compute(&snapshot, eval);
        self.complete(eval, snapshot.index(), output).await
    }

    /// Submit the computed plan and record the outcome. A blocked
    /// evaluation is pinned to `snapshot_index`, the state the placements
    /// were attempted against, so capacity that arrived while the plan was
    /// in flight releases it.
    async fn complete(
        &self,
        eval: &Evaluation,
        snapshot_index: u64,
        output: SchedulerOutput,
    ) -> SchedulerResult<()> {
        if !output.plan.is_no_op() {
            self.ctx.plans.submit(output.plan).await?;
        }

        let mut done = eval.clone();
        done.status = EvalStatus::Complete;
        done.status_description = String::new();
        done.queued_allocations = output.queued;
        done.failed_tg_allocs = output.failed_tg_allocs.clone();

        let blocked = if output.failed_tg_allocs.is_empty() {
            None
        } else {
            let blocked = eval.create_blocked_eval(output.failed_tg_allocs, snapshot_index);
            done.blocked_eval = Some(blocked.id.clone());
            Some(blocked)
        };

        let mut evals = vec![done];
        evals.extend(blocked.clone());
        self.ctx.state.apply(Command::UpsertEvals { evals })?;

        match blocked {
            Some(blocked) => {
                info!(
                    eval_id = %eval.id,
                    blocked_eval = %blocked.id,
                    "placements failed, created blocked evaluation"
                );
                if let Some(released) = self.ctx.blocked.block(blocked) {
                    self.ctx.state.apply(Command::UpsertEvals {
                        evals: vec![released.clone()],
                    })?;
                    self.ctx.broker.enqueue(released)?;
                }
            }
            None => self.ctx.blocked.untrack(&eval.job_key()),
        }
        Ok(())
    }
}

/// A fixed set of workers sharing one shutdown signal.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(count: usize, ctx: WorkerContext) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handles = (0..count)
            .map(|i| {
                let worker = Worker::new(format!("worker-{i}"), ctx.clone());
                tokio::spawn(worker.run(rx.clone()))
            })
            .collect();
        info!(count, "scheduler workers spawned");
        Self { shutdown, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every worker and wait for in-progress evaluations to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("scheduler workers stopped");
    }
}
