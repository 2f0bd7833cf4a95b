//! Domain types for the Corral state store.
//!
//! These types represent the persisted state of nodes, jobs, allocations,
//! evaluations, and plan results. All types are serializable to/from JSON
//! for storage in redb tables. Host volumes live in [`crate::volume`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::constraint::Constraint;
use crate::error::ValidationError;
use crate::volume::HostVolumeCapability;

pub type NodeId = String;
pub type JobId = String;
pub type AllocId = String;
pub type EvalId = String;
pub type VolumeId = String;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_NODE_POOL: &str = "default";

/// Unix timestamp in nanoseconds.
pub fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── Resources ──────────────────────────────────────────────────────

/// Compute resources, either a node's capacity or an allocation's ask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_mhz: u64,
    pub memory_mb: u64,
}

impl Resources {
    pub const fn new(cpu_mhz: u64, memory_mb: u64) -> Self {
        Self { cpu_mhz, memory_mb }
    }

    pub fn add(&mut self, other: &Resources) {
        self.cpu_mhz += other.cpu_mhz;
        self.memory_mb += other.memory_mb;
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_mhz: self.cpu_mhz.saturating_sub(other.cpu_mhz),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
        }
    }

    /// Returns the first dimension in which `ask` does not fit into `self`.
    pub fn exhausted_by(&self, ask: &Resources) -> Option<&'static str> {
        if ask.cpu_mhz > self.cpu_mhz {
            Some("cpu")
        } else if ask.memory_mb > self.memory_mb {
            Some("memory")
        } else {
            None
        }
    }
}

// ── Node ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Initializing,
    Ready,
    Down,
    Disconnected,
}

impl NodeStatus {
    /// Down nodes are tombstones: no heartbeat timer, no placements.
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Down)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Initializing => "initializing",
            NodeStatus::Ready => "ready",
            NodeStatus::Down => "down",
            NodeStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingEligibility {
    #[default]
    Eligible,
    Ineligible,
}

pub const NODE_EVENT_SUBSYSTEM_CLUSTER: &str = "Cluster";
pub const NODE_EVENT_SUBSYSTEM_DRAIN: &str = "Drain";
pub const NODE_EVENT_HEARTBEAT_MISSED: &str = "Node heartbeat missed";
pub const NODE_EVENT_REGISTERED: &str = "Node registered";
pub const NODE_EVENT_REREGISTERED: &str = "Node re-registered";
pub const NODE_EVENT_DEREGISTERED: &str = "Node deregistered";
pub const NODE_EVENT_DRAIN_ENABLED: &str = "Node drain strategy set";
pub const NODE_EVENT_DRAIN_DISABLED: &str = "Node drain disabled";

/// Append-only record of something that happened to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub message: String,
    pub subsystem: String,
    pub timestamp: i64,
    /// Filled in by the store when the event is committed.
    #[serde(default)]
    pub create_index: u64,
}

impl NodeEvent {
    pub fn new(subsystem: &str, message: &str) -> Self {
        Self {
            message: message.to_string(),
            subsystem: subsystem.to_string(),
            timestamp: now_nanos(),
            create_index: 0,
        }
    }

    pub fn heartbeat_missed() -> Self {
        Self::new(NODE_EVENT_SUBSYSTEM_CLUSTER, NODE_EVENT_HEARTBEAT_MISSED)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub node_pool: String,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub scheduling_eligibility: SchedulingEligibility,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    /// Total capacity of the node.
    #[serde(default)]
    pub resources: Resources,
    /// Capacity held back for the operating system and agent.
    #[serde(default)]
    pub reserved: Resources,
    #[serde(default)]
    pub events: Vec<NodeEvent>,
    #[serde(default)]
    pub status_updated_at: i64,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Node {
    pub fn new(id: &str, resources: Resources) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            node_pool: DEFAULT_NODE_POOL.to_string(),
            status: NodeStatus::Initializing,
            scheduling_eligibility: SchedulingEligibility::Eligible,
            attributes: BTreeMap::new(),
            meta: BTreeMap::new(),
            resources,
            reserved: Resources::default(),
            events: Vec::new(),
            status_updated_at: 0,
            create_index: 0,
            modify_index: 0,
        }
    }

    /// Ready and eligible for new placements.
    pub fn is_schedulable(&self) -> bool {
        self.status == NodeStatus::Ready
            && self.scheduling_eligibility == SchedulingEligibility::Eligible
    }

    pub fn is_draining(&self) -> bool {
        self.scheduling_eligibility == SchedulingEligibility::Ineligible
    }

    /// Capacity usable by allocations.
    pub fn allocatable(&self) -> Resources {
        self.resources.saturating_sub(&self.reserved)
    }

    pub fn canonicalize(&mut self) {
        if self.node_pool.is_empty() {
            self.node_pool = DEFAULT_NODE_POOL.to_string();
        }
        if self.name.is_empty() {
            self.name = self.id.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut err = ValidationError::default();
        if self.id.is_empty() {
            err.push("missing node ID");
        }
        if self.resources.cpu_mhz == 0 && self.resources.memory_mb == 0 {
            err.push("node must advertise resources");
        }
        err.into_result()
    }
}

// ── Job ────────────────────────────────────────────────────────────

pub const JOB_MIN_PRIORITY: u8 = 1;
pub const JOB_DEFAULT_PRIORITY: u8 = 50;
pub const JOB_MAX_PRIORITY: u8 = 100;

fn default_priority() -> u8 {
    JOB_DEFAULT_PRIORITY
}

/// A host volume requested by a task group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    /// Name of the host volume to mount.
    pub source: String,
    #[serde(default)]
    pub read_only: bool,
    /// Acceptable (attachment, access) pairs. Any one may match.
    #[serde(default)]
    pub capabilities: Vec<HostVolumeCapability>,
    #[serde(default)]
    pub min_capacity_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    pub count: u32,
    /// Per-instance ask.
    pub resources: Resources,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Keyed by the group-local volume label.
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub node_pool: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    pub task_groups: Vec<TaskGroup>,
    /// Set on deregistration. Stopped jobs have all allocations stopped.
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    #[serde(default)]
    pub submit_time: i64,
}

impl Job {
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.namespace, &self.id)
    }

    pub fn lookup_task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }

    pub fn canonicalize(&mut self) {
        if self.namespace.is_empty() {
            self.namespace = DEFAULT_NAMESPACE.to_string();
        }
        if self.name.is_empty() {
            self.name = self.id.clone();
        }
        if self.node_pool.is_empty() {
            self.node_pool = DEFAULT_NODE_POOL.to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut err = ValidationError::default();
        if self.id.is_empty() {
            err.push("missing job ID");
        } else if self.id.contains(' ') || self.id.contains('/') {
            err.push("job ID contains a space or slash");
        }
        if !(JOB_MIN_PRIORITY..=JOB_MAX_PRIORITY).contains(&self.priority) {
            err.push(format!(
                "job priority must be between [{JOB_MIN_PRIORITY}, {JOB_MAX_PRIORITY}]"
            ));
        }
        if self.task_groups.is_empty() {
            err.push("missing job task groups");
        }
        for c in &self.constraints {
            if let Err(e) = c.validate() {
                err.push(format!("constraint {c}: {e}"));
            }
        }

        let mut seen = BTreeSet::new();
        for tg in &self.task_groups {
            if tg.name.is_empty() {
                err.push("task group is missing a name");
            } else if !seen.insert(tg.name.as_str()) {
                err.push(format!("task group {:?} is defined more than once", tg.name));
            }
            for c in &tg.constraints {
                if let Err(e) = c.validate() {
                    err.push(format!("group {:?} constraint {c}: {e}", tg.name));
                }
            }
            for (label, vol) in &tg.volumes {
                if vol.source.is_empty() {
                    err.push(format!("group {:?} volume {label:?} has an empty source", tg.name));
                }
                for cap in &vol.capabilities {
                    if let Err(e) = cap.validate() {
                        err.push(format!("group {:?} volume {label:?}: {e}", tg.name));
                    }
                }
            }
        }
        err.into_result()
    }
}

/// Jobs are unique per namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub namespace: String,
    pub job_id: JobId,
}

impl JobKey {
    pub fn new(namespace: &str, job_id: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            job_id: job_id.to_string(),
        }
    }

    /// redb key: `{namespace}/{job_id}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.job_id)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.job_id)
    }
}

// ── Allocation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocDesiredStatus {
    #[default]
    Run,
    Stop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocClientStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
}

impl AllocClientStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AllocClientStatus::Complete | AllocClientStatus::Failed | AllocClientStatus::Lost
        )
    }
}

/// An allocation's hold on a host volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeClaim {
    pub volume_id: VolumeId,
    pub volume_name: String,
    pub attachment_mode: crate::volume::HostVolumeAttachmentMode,
    pub access_mode: crate::volume::HostVolumeAccessMode,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocId,
    pub eval_id: EvalId,
    /// `{job}.{group}[{index}]`
    pub name: String,
    pub namespace: String,
    pub job_id: JobId,
    pub task_group: String,
    pub node_id: NodeId,
    pub resources: Resources,
    #[serde(default)]
    pub volume_claims: Vec<VolumeClaim>,
    #[serde(default)]
    pub desired_status: AllocDesiredStatus,
    #[serde(default)]
    pub desired_description: String,
    #[serde(default)]
    pub client_status: AllocClientStatus,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub modify_time: i64,
}

impl Allocation {
    pub fn alloc_name(job_id: &str, group: &str, index: u32) -> String {
        format!("{job_id}.{group}[{index}]")
    }

    /// Index parsed back out of the allocation name.
    pub fn name_index(&self) -> Option<u32> {
        let open = self.name.rfind('[')?;
        let close = self.name.rfind(']')?;
        self.name.get(open + 1..close)?.parse().ok()
    }

    pub fn job_key(&self) -> JobKey {
        JobKey::new(&self.namespace, &self.job_id)
    }

    /// Stopped by the server or finished on the client.
    pub fn is_terminal(&self) -> bool {
        self.desired_status != AllocDesiredStatus::Run || self.client_status.is_terminal()
    }

    /// Claims are held until the client reports a terminal status, or the
    /// server stops the allocation.
    pub fn holds_claims(&self) -> bool {
        !self.is_terminal()
    }

    pub fn stub(&self) -> AllocationStub {
        AllocationStub {
            id: self.id.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            job_id: self.job_id.clone(),
            task_group: self.task_group.clone(),
            node_id: self.node_id.clone(),
            desired_status: self.desired_status,
            client_status: self.client_status,
            create_index: self.create_index,
            modify_index: self.modify_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationStub {
    pub id: AllocId,
    pub name: String,
    pub namespace: String,
    pub job_id: JobId,
    pub task_group: String,
    pub node_id: NodeId,
    pub desired_status: AllocDesiredStatus,
    pub client_status: AllocClientStatus,
    pub create_index: u64,
    pub modify_index: u64,
}

// ── Evaluation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvalTrigger {
    JobRegister,
    JobDeregister,
    JobScaling,
    NodeUpdate,
    NodeDrain,
    AllocFailure,
    QueuedAllocs,
    MaxPlanAttempts,
}

impl fmt::Display for EvalTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvalTrigger::JobRegister => "job-register",
            EvalTrigger::JobDeregister => "job-deregister",
            EvalTrigger::JobScaling => "job-scaling",
            EvalTrigger::NodeUpdate => "node-update",
            EvalTrigger::NodeDrain => "node-drain",
            EvalTrigger::AllocFailure => "alloc-failure",
            EvalTrigger::QueuedAllocs => "queued-allocs",
            EvalTrigger::MaxPlanAttempts => "max-plan-attempts",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    #[default]
    Pending,
    Running,
    Blocked,
    Complete,
    Failed,
    Canceled,
}

impl EvalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EvalStatus::Complete | EvalStatus::Failed | EvalStatus::Canceled
        )
    }
}

impl fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvalStatus::Pending => "pending",
            EvalStatus::Running => "running",
            EvalStatus::Blocked => "blocked",
            EvalStatus::Complete => "complete",
            EvalStatus::Failed => "failed",
            EvalStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Why placements for one task group failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocMetric {
    pub nodes_evaluated: u32,
    pub nodes_filtered: u32,
    pub nodes_in_pool: u32,
    pub nodes_exhausted: u32,
    /// Filter reason → number of nodes rejected for it.
    pub constraint_filtered: BTreeMap<String, u32>,
    /// Resource dimension → number of nodes out of it.
    pub dimension_exhausted: BTreeMap<String, u32>,
    /// Further placements of the same group that failed for the same reasons.
    pub coalesced_failures: u32,
}

impl AllocMetric {
    pub fn filter_node(&mut self, reason: &str) {
        self.nodes_filtered += 1;
        *self.constraint_filtered.entry(reason.to_string()).or_default() += 1;
    }

    pub fn exhausted_node(&mut self, dimension: &str) {
        self.nodes_exhausted += 1;
        *self
            .dimension_exhausted
            .entry(dimension.to_string())
            .or_default() += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: EvalId,
    pub namespace: String,
    pub job_id: JobId,
    pub priority: u8,
    pub triggered_by: EvalTrigger,
    #[serde(default)]
    pub status: EvalStatus,
    #[serde(default)]
    pub status_description: String,
    /// Node whose change raised this evaluation, if any.
    #[serde(default)]
    pub node_id: Option<NodeId>,
    /// Minimum state index a worker must observe before scheduling.
    #[serde(default)]
    pub snapshot_index: u64,
    #[serde(default)]
    pub previous_eval: Option<EvalId>,
    #[serde(default)]
    pub blocked_eval: Option<EvalId>,
    #[serde(default)]
    pub failed_tg_allocs: BTreeMap<String, AllocMetric>,
    /// Task group → placements still waiting for capacity.
    #[serde(default)]
    pub queued_allocations: BTreeMap<String, u32>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub modify_time: i64,
}

impl Evaluation {
    pub fn new(namespace: &str, job_id: &str, priority: u8, triggered_by: EvalTrigger) -> Self {
        Self {
            id: generate_id(),
            namespace: namespace.to_string(),
            job_id: job_id.to_string(),
            priority,
            triggered_by,
            status: EvalStatus::Pending,
            status_description: String::new(),
            node_id: None,
            snapshot_index: 0,
            previous_eval: None,
            blocked_eval: None,
            failed_tg_allocs: BTreeMap::new(),
            queued_allocations: BTreeMap::new(),
            create_index: 0,
            modify_index: 0,
            create_time: 0,
            modify_time: 0,
        }
    }

    pub fn for_job(job: &Job, triggered_by: EvalTrigger) -> Self {
        Self::new(&job.namespace, &job.id, job.priority, triggered_by)
    }

    pub fn job_key(&self) -> JobKey {
        JobKey::new(&self.namespace, &self.job_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Follow-up evaluation that waits for capacity on behalf of this one.
    pub fn create_blocked_eval(
        &self,
        failed_tg_allocs: BTreeMap<String, AllocMetric>,
        snapshot_index: u64,
    ) -> Evaluation {
        let mut blocked = Evaluation::new(
            &self.namespace,
            &self.job_id,
            self.priority,
            EvalTrigger::QueuedAllocs,
        );
        blocked.status = EvalStatus::Blocked;
        blocked.status_description = "created to place remaining allocations".to_string();
        blocked.previous_eval = Some(self.id.clone());
        blocked.snapshot_index = snapshot_index;
        blocked.failed_tg_allocs = failed_tg_allocs;
        blocked
    }
}

// ── Plan ───────────────────────────────────────────────────────────

/// A proposed, snapshot-pinned set of allocation changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub eval_id: EvalId,
    pub namespace: String,
    pub job_id: JobId,
    pub priority: u8,
    /// State index the plan was computed against.
    pub snapshot_index: u64,
    /// Allocations to stop, by node.
    #[serde(default)]
    pub node_update: BTreeMap<NodeId, Vec<Allocation>>,
    /// Allocations to create, by node.
    #[serde(default)]
    pub node_allocation: BTreeMap<NodeId, Vec<Allocation>>,
}

impl Plan {
    pub fn for_eval(eval: &Evaluation, snapshot_index: u64) -> Self {
        Self {
            eval_id: eval.id.clone(),
            namespace: eval.namespace.clone(),
            job_id: eval.job_id.clone(),
            priority: eval.priority,
            snapshot_index,
            node_update: BTreeMap::new(),
            node_allocation: BTreeMap::new(),
        }
    }

    pub fn append_alloc(&mut self, alloc: Allocation) {
        self.node_allocation
            .entry(alloc.node_id.clone())
            .or_default()
            .push(alloc);
    }

    /// Queue an existing allocation to be stopped. `client_status` overrides
    /// what the client last reported, used to mark allocations lost.
    pub fn append_stopped_alloc(
        &mut self,
        alloc: &Allocation,
        description: &str,
        client_status: Option<AllocClientStatus>,
    ) {
        let mut stopped = alloc.clone();
        stopped.desired_status = AllocDesiredStatus::Stop;
        stopped.desired_description = description.to_string();
        if let Some(status) = client_status {
            stopped.client_status = status;
        }
        self.node_update
            .entry(alloc.node_id.clone())
            .or_default()
            .push(stopped);
    }

    pub fn is_no_op(&self) -> bool {
        self.node_update.values().all(Vec::is_empty)
            && self.node_allocation.values().all(Vec::is_empty)
    }

    pub fn touched_nodes(&self) -> BTreeSet<&str> {
        self.node_update
            .iter()
            .chain(self.node_allocation.iter())
            .filter(|(_, allocs)| !allocs.is_empty())
            .map(|(node_id, _)| node_id.as_str())
            .collect()
    }

    pub fn touched_volumes(&self) -> BTreeSet<&str> {
        self.node_update
            .values()
            .chain(self.node_allocation.values())
            .flatten()
            .flat_map(|a| a.volume_claims.iter())
            .map(|c| c.volume_id.as_str())
            .collect()
    }

    pub fn placed_allocs(&self) -> impl Iterator<Item = &Allocation> {
        self.node_allocation.values().flatten()
    }

    pub fn stopped_allocs(&self) -> impl Iterator<Item = &Allocation> {
        self.node_update.values().flatten()
    }
}

/// What the applier committed for a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanResult {
    pub eval_id: EvalId,
    /// Write index of the commit.
    pub alloc_index: u64,
    pub placed: Vec<AllocId>,
    pub stopped: Vec<AllocId>,
}

impl PlanResult {
    pub fn from_plan(plan: &Plan, alloc_index: u64) -> Self {
        Self {
            eval_id: plan.eval_id.clone(),
            alloc_index,
            placed: plan.placed_allocs().map(|a| a.id.clone()).collect(),
            stopped: plan.stopped_allocs().map(|a| a.id.clone()).collect(),
        }
    }
}
