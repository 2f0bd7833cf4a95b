//! The server: shared components plus the leader lifecycle.
//!
//! A [`Server`] owns one of each leader-only component. They sit idle until
//! [`Server::establish_leadership`] starts them under a fresh epoch, and are
//! torn down together by [`Server::revoke_leadership`]. Everything they hold
//! is rebuilt from the state store on the next term.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use corral_broker::{BlockedEvals, EvalBroker};
use corral_core::{GcConfig, LeaderEpoch, ServerConfig};
use corral_heartbeat::{BoxFuture, HeartbeatMonitor, NodeDownCallback};
use corral_scheduler::{PlanCommitCallback, PlanQueue, WorkerContext, WorkerPool};
use corral_state::{
    Command, EvalStatus, EvalTrigger, Evaluation, NodeId, Plan, PlanResult, StateStore,
};

use crate::error::{ServerError, ServerResult};
use crate::provisioner::{StaticProvisioner, VolumeProvisioner};

/// Commits follow-up evaluations and hands them to the broker.
///
/// Shared by endpoints and by the callbacks of leader components, so it
/// only holds clones and never the server itself.
#[derive(Clone)]
pub(crate) struct EvalDispatch {
    state: StateStore,
    broker: EvalBroker,
    blocked: BlockedEvals,
}

impl EvalDispatch {
    /// Enqueue evaluations already committed at `index`.
    pub(crate) fn enqueue(&self, evals: Vec<Evaluation>, index: u64) {
        for mut eval in evals {
            eval.snapshot_index = eval.snapshot_index.max(index);
            let eval_id = eval.id.clone();
            if let Err(e) = self.broker.enqueue(eval) {
                warn!(%eval_id, error = %e, "failed to enqueue evaluation");
            }
        }
    }

    /// One evaluation per job with live allocations on the node.
    pub(crate) fn node_evals(
        &self,
        node_id: &str,
        trigger: EvalTrigger,
    ) -> ServerResult<Vec<Evaluation>> {
        let mut evals: Vec<Evaluation> = Vec::new();
        for alloc in self.state.allocs_by_node(node_id)? {
            if alloc.is_terminal() || evals.iter().any(|e| e.job_key() == alloc.job_key()) {
                continue;
            }
            let priority = self
                .state
                .get_job(&alloc.namespace, &alloc.job_id)?
                .map(|j| j.priority)
                .unwrap_or(corral_state::JOB_DEFAULT_PRIORITY);
            let mut eval = Evaluation::new(&alloc.namespace, &alloc.job_id, priority, trigger);
            eval.node_id = Some(node_id.to_string());
            evals.push(eval);
        }
        Ok(evals)
    }

    /// Release blocked evaluations after a capacity change at `index`.
    pub(crate) fn unblock(&self, index: u64) -> ServerResult<usize> {
        let released = self.blocked.unblock(index);
        if released.is_empty() {
            return Ok(0);
        }
        let count = released.len();
        let commit = self.state.apply(Command::UpsertEvals {
            evals: released.clone(),
        })?;
        self.enqueue(released, commit);
        Ok(count)
    }

    async fn node_down(&self, node_id: String) {
        let evals = match self.node_evals(&node_id, EvalTrigger::NodeUpdate) {
            Ok(evals) if evals.is_empty() => return,
            Ok(evals) => evals,
            Err(e) => {
                error!(%node_id, error = %e, "failed to build evaluations for down node");
                return;
            }
        };
        match self.state.apply(Command::UpsertEvals { evals: evals.clone() }) {
            Ok(index) => {
                info!(%node_id, count = evals.len(), "created evaluations for down node");
                self.enqueue(evals, index);
            }
            Err(e) => error!(%node_id, error = %e, "failed to commit evaluations for down node"),
        }
    }
}

/// Periodic leader housekeeping: terminal broker output and eval GC.
#[derive(Clone)]
struct Housekeeper {
    state: StateStore,
    broker: EvalBroker,
    blocked: BlockedEvals,
    gc: GcConfig,
}

impl Housekeeper {
    /// Commit evaluations the broker failed or canceled, and duplicate
    /// blocked evaluations.
    fn reap(&self) -> ServerResult<usize> {
        let mut evals = self.broker.take_failed();
        evals.extend(self.broker.take_canceled());
        evals.extend(self.blocked.take_duplicates());
        if evals.is_empty() {
            return Ok(0);
        }
        let count = evals.len();
        let index = self.state.apply(Command::UpsertEvals { evals })?;
        debug!(count, index, "reaped terminal evaluations");
        Ok(count)
    }

    /// Delete evaluations that have been terminal for at least
    /// `eval_gc_threshold` indexes.
    fn gc_evals(&self) -> ServerResult<usize> {
        let latest = self.state.latest_index()?;
        let eval_ids: Vec<String> = self
            .state
            .list_evals()?
            .into_iter()
            .filter(|e| {
                e.is_terminal() && e.modify_index.saturating_add(self.gc.eval_gc_threshold) <= latest
            })
            .map(|e| e.id)
            .collect();
        if eval_ids.is_empty() {
            return Ok(0);
        }
        let count = eval_ids.len();
        self.state.apply(Command::DeleteEvals { eval_ids })?;
        info!(count, "garbage collected evaluations");
        Ok(count)
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut reap = tokio::time::interval(self.gc.reap_interval());
        let mut gc = tokio::time::interval(self.gc.eval_gc_interval());
        loop {
            tokio::select! {
                _ = reap.tick() => {
                    if let Err(e) = self.reap() {
                        error!(error = %e, "eval reaper failed");
                    }
                }
                _ = gc.tick() => {
                    if let Err(e) = self.gc_evals() {
                        error!(error = %e, "eval GC failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

struct LeaderTasks {
    epoch: LeaderEpoch,
    workers: WorkerPool,
    shutdown: watch::Sender<bool>,
    housekeeping: JoinHandle<()>,
}

pub(crate) struct ServerInner {
    pub(crate) config: ServerConfig,
    pub(crate) state: StateStore,
    pub(crate) heartbeat: HeartbeatMonitor,
    pub(crate) broker: EvalBroker,
    pub(crate) blocked: BlockedEvals,
    pub(crate) plans: PlanQueue,
    pub(crate) provisioner: Arc<dyn VolumeProvisioner>,
    pub(crate) dispatch: EvalDispatch,
    housekeeper: Housekeeper,
    leader: Mutex<Option<LeaderTasks>>,
    terms: AtomicU64,
}

/// A control-plane server. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: ServerConfig, state: StateStore) -> Self {
        Self::with_provisioner(config, state, Arc::new(StaticProvisioner::default()))
    }

    pub fn with_provisioner(
        config: ServerConfig,
        state: StateStore,
        provisioner: Arc<dyn VolumeProvisioner>,
    ) -> Self {
        let broker = EvalBroker::new(config.broker.clone());
        let blocked = BlockedEvals::new();
        let dispatch = EvalDispatch {
            state: state.clone(),
            broker: broker.clone(),
            blocked: blocked.clone(),
        };

        let on_down = dispatch.clone();
        let on_node_down: NodeDownCallback = Arc::new(move |node_id: NodeId| -> BoxFuture {
            let dispatch = on_down.clone();
            Box::pin(async move { dispatch.node_down(node_id).await })
        });
        let heartbeat =
            HeartbeatMonitor::new(state.clone(), config.heartbeat.clone()).with_callback(on_node_down);

        let on_plan = dispatch.clone();
        let on_commit: PlanCommitCallback = Arc::new(move |_plan: &Plan, result: &PlanResult| {
            if result.stopped.is_empty() {
                return;
            }
            if let Err(e) = on_plan.unblock(result.alloc_index) {
                error!(index = result.alloc_index, error = %e, "failed to unblock evaluations");
            }
        });
        let plans = PlanQueue::new(state.clone()).with_callback(on_commit);

        let housekeeper = Housekeeper {
            state: state.clone(),
            broker: broker.clone(),
            blocked: blocked.clone(),
            gc: config.gc.clone(),
        };

        Self {
            inner: Arc::new(ServerInner {
                config,
                state,
                heartbeat,
                broker,
                blocked,
                plans,
                provisioner,
                dispatch,
                housekeeper,
                leader: Mutex::new(None),
                terms: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> &StateStore {
        &self.inner.state
    }

    pub fn heartbeat_monitor(&self) -> &HeartbeatMonitor {
        &self.inner.heartbeat
    }

    pub fn broker(&self) -> &EvalBroker {
        &self.inner.broker
    }

    pub fn blocked(&self) -> &BlockedEvals {
        &self.inner.blocked
    }

    pub fn is_leader(&self) -> bool {
        self.inner.broker.is_enabled()
    }

    pub(crate) fn ensure_leader(&self) -> ServerResult<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(ServerError::NotLeader)
        }
    }

    // ── Leadership ─────────────────────────────────────────────────

    /// Start every leader-only component and restore pending work from the
    /// state store. Idempotent while already leader.
    pub async fn establish_leadership(&self) -> ServerResult<LeaderEpoch> {
        let mut leader = self.inner.leader.lock().await;
        if let Some(tasks) = leader.as_ref() {
            return Ok(tasks.epoch);
        }

        let epoch = LeaderEpoch::new(self.inner.terms.fetch_add(1, Ordering::SeqCst) + 1);
        let inner = &self.inner;
        inner.broker.start(epoch);
        inner.blocked.start(epoch);
        inner.plans.start(epoch);

        if let Err(e) = self.restore(epoch).await {
            inner.plans.stop();
            inner.broker.stop();
            inner.blocked.stop();
            inner.heartbeat.clear_all().await;
            error!(%epoch, error = %e, "failed to establish leadership");
            return Err(e);
        }

        let workers = WorkerPool::spawn(
            inner.config.scheduler.num_schedulers,
            WorkerContext {
                state: inner.state.clone(),
                broker: inner.broker.clone(),
                blocked: inner.blocked.clone(),
                plans: inner.plans.clone(),
                dequeue_timeout: inner.config.scheduler.dequeue_timeout(),
            },
        );
        let (shutdown, rx) = watch::channel(false);
        let housekeeping = tokio::spawn(inner.housekeeper.clone().run(rx));

        *leader = Some(LeaderTasks {
            epoch,
            workers,
            shutdown,
            housekeeping,
        });
        info!(%epoch, node_id = %inner.config.node_id, "leadership established");
        Ok(epoch)
    }

    async fn restore(&self, epoch: LeaderEpoch) -> ServerResult<()> {
        let inner = &self.inner;
        let mut evals = inner.state.list_evals()?;
        evals.sort_by_key(|e| e.create_index);

        let (mut pending, mut blocked) = (0usize, 0usize);
        for eval in evals {
            match eval.status {
                EvalStatus::Pending | EvalStatus::Running => {
                    inner.broker.enqueue(eval)?;
                    pending += 1;
                }
                EvalStatus::Blocked => {
                    if let Some(released) = inner.blocked.block(eval) {
                        inner.broker.enqueue(released)?;
                    }
                    blocked += 1;
                }
                _ => {}
            }
        }
        debug!(%epoch, pending, blocked, "restored evaluations");

        inner.heartbeat.initialize(epoch).await?;
        Ok(())
    }

    /// Tear down every leader-only component. In-flight plan submissions
    /// fail with `NotLeader`; queued work is dropped and rebuilt by the next
    /// leader from the state store.
    pub async fn revoke_leadership(&self) {
        let Some(tasks) = self.inner.leader.lock().await.take() else {
            return;
        };
        let inner = &self.inner;
        inner.plans.stop();
        inner.broker.stop();
        inner.blocked.stop();
        inner.heartbeat.clear_all().await;

        let _ = tasks.shutdown.send(true);
        tasks.workers.shutdown().await;
        let _ = tasks.housekeeping.await;
        info!(epoch = %tasks.epoch, node_id = %inner.config.node_id, "leadership revoked");
    }

    pub async fn leader_epoch(&self) -> Option<LeaderEpoch> {
        self.inner.leader.lock().await.as_ref().map(|t| t.epoch)
    }

    // ── Housekeeping ───────────────────────────────────────────────

    /// Run one reaper pass now. Returns the number of evaluations committed.
    pub fn reap_once(&self) -> ServerResult<usize> {
        self.ensure_leader()?;
        self.inner.housekeeper.reap()
    }

    /// Run one eval GC pass now. Returns the number of evaluations deleted.
    pub fn gc_evals_once(&self) -> ServerResult<usize> {
        self.ensure_leader()?;
        self.inner.housekeeper.gc_evals()
    }
}
