//! StateStore — redb-backed, versioned state for the Corral control plane.
//!
//! Every mutation goes through [`StateStore::apply`], which commits one
//! [`Command`] in a single write transaction and stamps it with the next
//! write index. Reads either hit a table directly or take a
//! [`StateSnapshot`] of every table at one index.
//!
//! Besides the entity tables the store keeps a touch index per node and per
//! volume. Plans are checked against those indexes at commit time, which
//! makes plan application optimistic: a plan computed against index N is
//! rejected if anything it touches changed after N.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::command::{AllocClientUpdate, Command};
use crate::error::{StateError, StateResult};
use crate::snapshot::StateSnapshot;
use crate::tables::*;
use crate::types::*;
use crate::volume::{HostVolume, volume_key};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;
type IndexTable = TableDefinition<'static, &'static str, u64>;

/// Nodes keep only their most recent events.
pub const MAX_NODE_EVENTS: usize = 10;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for def in [NODES, JOBS, ALLOCS, EVALS, HOST_VOLUMES, PLAN_RESULTS] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.open_table(INDEXES).map_err(map_err!(Table))?;
        txn.open_table(TOUCHED).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Commit path ────────────────────────────────────────────────

    /// Commit a command and return the write index it was assigned.
    ///
    /// Nothing is written if the command is rejected.
    pub fn apply(&self, command: Command) -> StateResult<u64> {
        let kind = command.kind();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let index = read_index(&txn, INDEXES, LATEST_INDEX)? + 1;

        let result = {
            let mut writer = Writer::new(&txn, index);
            writer.apply(command).and_then(|()| writer.finish())
        };

        match result {
            Ok(()) => {
                txn.commit().map_err(map_err!(Transaction))?;
                debug!(index, kind, "command committed");
                Ok(index)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                debug!(kind, error = %e, "command rejected");
                Err(e)
            }
        }
    }

    // ── Indexes ────────────────────────────────────────────────────

    /// The most recent write index, 0 for an empty store.
    pub fn latest_index(&self) -> StateResult<u64> {
        self.index_of(LATEST_INDEX)
    }

    /// Last write index at which the named table changed.
    pub fn table_index(&self, table: &str) -> StateResult<u64> {
        self.index_of(table)
    }

    fn index_of(&self, key: &str) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INDEXES).map_err(map_err!(Table))?;
        Ok(table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0))
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Load every table at a single write index.
    pub fn snapshot(&self) -> StateResult<StateSnapshot> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let mut snap = StateSnapshot::default();

        let indexes = txn.open_table(INDEXES).map_err(map_err!(Table))?;
        snap.index = indexes
            .get(LATEST_INDEX)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);

        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        snap.nodes = scan_keyed(&table)?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        snap.jobs = scan_keyed(&table)?;
        let table = txn.open_table(ALLOCS).map_err(map_err!(Table))?;
        snap.allocs = scan_keyed(&table)?;
        let table = txn.open_table(EVALS).map_err(map_err!(Table))?;
        snap.evals = scan_keyed(&table)?;
        let table = txn.open_table(HOST_VOLUMES).map_err(map_err!(Table))?;
        snap.host_volumes = scan_keyed(&table)?;

        let touched = txn.open_table(TOUCHED).map_err(map_err!(Table))?;
        for entry in touched.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            snap.touched.insert(key.value().to_string(), value.value());
        }

        Ok(snap)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn get_node(&self, node_id: &str) -> StateResult<Option<Node>> {
        self.get_json(NODES, node_id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.list_json(NODES)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub fn get_job(&self, namespace: &str, job_id: &str) -> StateResult<Option<Job>> {
        self.get_json(JOBS, &JobKey::new(namespace, job_id).table_key())
    }

    pub fn list_jobs(&self) -> StateResult<Vec<Job>> {
        self.list_json(JOBS)
    }

    // ── Allocations ────────────────────────────────────────────────

    pub fn get_alloc(&self, alloc_id: &str) -> StateResult<Option<Allocation>> {
        self.get_json(ALLOCS, alloc_id)
    }

    pub fn allocs_by_job(&self, namespace: &str, job_id: &str) -> StateResult<Vec<Allocation>> {
        let all: Vec<Allocation> = self.list_json(ALLOCS)?;
        Ok(all
            .into_iter()
            .filter(|a| a.namespace == namespace && a.job_id == job_id)
            .collect())
    }

    pub fn allocs_by_node(&self, node_id: &str) -> StateResult<Vec<Allocation>> {
        let all: Vec<Allocation> = self.list_json(ALLOCS)?;
        Ok(all.into_iter().filter(|a| a.node_id == node_id).collect())
    }

    // ── Evaluations ────────────────────────────────────────────────

    pub fn get_eval(&self, eval_id: &str) -> StateResult<Option<Evaluation>> {
        self.get_json(EVALS, eval_id)
    }

    pub fn list_evals(&self) -> StateResult<Vec<Evaluation>> {
        self.list_json(EVALS)
    }

    // ── Host volumes ───────────────────────────────────────────────

    /// The stored record, without denormalized claims.
    pub fn get_host_volume(&self, namespace: &str, volume_id: &str) -> StateResult<Option<HostVolume>> {
        self.get_json(HOST_VOLUMES, &volume_key(namespace, volume_id))
    }

    /// All volumes ordered by namespace, then ID.
    pub fn list_host_volumes(&self) -> StateResult<Vec<HostVolume>> {
        self.list_json(HOST_VOLUMES)
    }

    // ── Plan results ───────────────────────────────────────────────

    pub fn get_plan_result(&self, eval_id: &str) -> StateResult<Option<PlanResult>> {
        self.get_json(PLAN_RESULTS, eval_id)
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        read_json(&table, key)
    }

    fn list_json<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }
}

fn read_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn scan_keyed<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
) -> StateResult<std::collections::BTreeMap<String, T>> {
    let mut results = std::collections::BTreeMap::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        results.insert(key.value().to_string(), item);
    }
    Ok(results)
}

fn read_index(txn: &WriteTransaction, def: IndexTable, key: &str) -> StateResult<u64> {
    let table = txn.open_table(def).map_err(map_err!(Table))?;
    Ok(table
        .get(key)
        .map_err(map_err!(Read))?
        .map(|g| g.value())
        .unwrap_or(0))
}

// ── Write transaction ──────────────────────────────────────────────

/// Applies one command inside an open write transaction.
struct Writer<'t> {
    txn: &'t WriteTransaction,
    index: u64,
    now: i64,
    changed: BTreeSet<&'static str>,
}

impl<'t> Writer<'t> {
    fn new(txn: &'t WriteTransaction, index: u64) -> Self {
        Self {
            txn,
            index,
            now: now_nanos(),
            changed: BTreeSet::new(),
        }
    }

    fn apply(&mut self, command: Command) -> StateResult<()> {
        match command {
            Command::UpsertNode { node } => self.upsert_node(node),
            Command::UpdateNodeStatus {
                node_id,
                status,
                event,
                evals,
            } => {
                self.update_node(&node_id, event, |node, now| {
                    node.status = status;
                    node.status_updated_at = now;
                })?;
                self.upsert_evals(evals)
            }
            Command::UpdateNodeEligibility {
                node_id,
                eligibility,
                event,
                evals,
            } => {
                self.update_node(&node_id, event, |node, _| {
                    node.scheduling_eligibility = eligibility;
                })?;
                self.upsert_evals(evals)
            }
            Command::UpsertJob { job, eval, check_index } => {
                self.upsert_job(job, check_index)?;
                self.upsert_evals(eval.into_iter().collect())
            }
            Command::UpsertEvals { evals } => self.upsert_evals(evals),
            Command::DeleteEvals { eval_ids } => self.delete_evals(&eval_ids),
            Command::ApplyPlan { plan } => self.apply_plan(&plan),
            Command::UpdateAllocsFromClient { updates, evals } => {
                self.update_allocs_from_client(&updates)?;
                self.upsert_evals(evals)
            }
            Command::UpsertHostVolumes { volumes } => self.upsert_host_volumes(volumes),
            Command::DeleteHostVolumes {
                namespace,
                volume_ids,
            } => self.delete_host_volumes(&namespace, &volume_ids),
        }
    }

    /// Record table indexes and the new latest index.
    fn finish(self) -> StateResult<()> {
        let mut table = self.txn.open_table(INDEXES).map_err(map_err!(Table))?;
        for name in &self.changed {
            table.insert(*name, self.index).map_err(map_err!(Write))?;
        }
        table
            .insert(LATEST_INDEX, self.index)
            .map_err(map_err!(Write))?;
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    fn upsert_node(&mut self, mut node: Node) -> StateResult<()> {
        node.canonicalize();
        match self.load::<Node>(NODES, &node.id)? {
            Some(existing) => {
                node.create_index = existing.create_index;
                let mut events = existing.events;
                events.append(&mut node.events);
                node.events = events;
                if existing.status != node.status {
                    node.status_updated_at = self.now;
                }
            }
            None => {
                node.create_index = self.index;
                node.status_updated_at = self.now;
            }
        }
        node.modify_index = self.index;
        self.stamp_events(&mut node);
        self.put(NODES, &node.id, &node)?;
        self.touch(node_touch_key(&node.id))?;
        self.changed.insert("nodes");
        Ok(())
    }

    fn update_node(
        &mut self,
        node_id: &str,
        event: Option<NodeEvent>,
        mutate: impl FnOnce(&mut Node, i64),
    ) -> StateResult<()> {
        let mut node: Node = self
            .load(NODES, node_id)?
            .ok_or_else(|| StateError::NotFound(format!("node {node_id}")))?;
        mutate(&mut node, self.now);
        node.events.extend(event);
        node.modify_index = self.index;
        self.stamp_events(&mut node);
        self.put(NODES, node_id, &node)?;
        self.touch(node_touch_key(node_id))?;
        self.changed.insert("nodes");
        Ok(())
    }

    fn stamp_events(&self, node: &mut Node) {
        for event in node.events.iter_mut().filter(|e| e.create_index == 0) {
            event.create_index = self.index;
        }
        if node.events.len() > MAX_NODE_EVENTS {
            let excess = node.events.len() - MAX_NODE_EVENTS;
            node.events.drain(..excess);
        }
    }

    // ── Jobs ───────────────────────────────────────────────────────

    fn upsert_job(&mut self, mut job: Job, check_index: Option<u64>) -> StateResult<()> {
        job.canonicalize();
        let key = job.key().table_key();
        let existing = self.load::<Job>(JOBS, &key)?;
        if let Some(check) = check_index {
            let current = existing.as_ref().map_or(0, |j| j.modify_index);
            if current != check {
                return Err(StateError::Conflict(format!(
                    "job modify index {current} does not match check index {check}"
                )));
            }
        }
        match existing {
            Some(existing) => {
                job.create_index = existing.create_index;
                job.version = existing.version + 1;
            }
            None => {
                job.create_index = self.index;
                job.version = 0;
            }
        }
        job.modify_index = self.index;
        job.submit_time = self.now;
        self.put(JOBS, &key, &job)?;
        self.changed.insert("jobs");
        Ok(())
    }

    // ── Evaluations ────────────────────────────────────────────────

    fn upsert_evals(&mut self, evals: Vec<Evaluation>) -> StateResult<()> {
        if evals.is_empty() {
            return Ok(());
        }
        for mut eval in evals {
            match self.load::<Evaluation>(EVALS, &eval.id)? {
                Some(existing) => {
                    eval.create_index = existing.create_index;
                    eval.create_time = existing.create_time;
                }
                None => {
                    eval.create_index = self.index;
                    eval.create_time = self.now;
                }
            }
            eval.modify_index = self.index;
            eval.modify_time = self.now;
            self.put(EVALS, &eval.id, &eval)?;
        }
        self.changed.insert("evals");
        Ok(())
    }

    fn delete_evals(&mut self, eval_ids: &[EvalId]) -> StateResult<()> {
        let mut table = self.txn.open_table(EVALS).map_err(map_err!(Table))?;
        for id in eval_ids {
            table.remove(id.as_str()).map_err(map_err!(Write))?;
        }
        self.changed.insert("evals");
        Ok(())
    }

    // ── Plans ──────────────────────────────────────────────────────

    fn apply_plan(&mut self, plan: &Plan) -> StateResult<()> {
        for node_id in plan.touched_nodes() {
            self.check_fresh(&node_touch_key(node_id), &format!("node {node_id}"), plan)?;
        }
        for volume_id in plan.touched_volumes() {
            self.check_fresh(&volume_touch_key(volume_id), &format!("volume {volume_id}"), plan)?;
        }

        for (node_id, allocs) in &plan.node_allocation {
            if allocs.is_empty() {
                continue;
            }
            let schedulable = self
                .load::<Node>(NODES, node_id)?
                .is_some_and(|n| n.is_schedulable());
            if !schedulable {
                return Err(StateError::Conflict(format!(
                    "node {node_id} is not accepting placements"
                )));
            }
        }

        for stop in plan.stopped_allocs() {
            let Some(mut alloc) = self.load::<Allocation>(ALLOCS, &stop.id)? else {
                return Err(StateError::NotFound(format!("allocation {}", stop.id)));
            };
            alloc.desired_status = stop.desired_status;
            alloc.desired_description = stop.desired_description.clone();
            alloc.client_status = stop.client_status;
            self.write_alloc(alloc)?;
        }

        for placed in plan.placed_allocs() {
            let mut alloc = placed.clone();
            alloc.create_index = self.index;
            alloc.create_time = self.now;
            self.write_alloc(alloc)?;
        }

        let result = PlanResult::from_plan(plan, self.index);
        self.put(PLAN_RESULTS, &plan.eval_id, &result)?;
        self.changed.insert("plan_results");
        Ok(())
    }

    fn check_fresh(&self, touch_key: &str, entity: &str, plan: &Plan) -> StateResult<()> {
        let modify_index = read_index(self.txn, TOUCHED, touch_key)?;
        if modify_index > plan.snapshot_index {
            return Err(StateError::StalePlan {
                entity: entity.to_string(),
                modify_index,
                snapshot_index: plan.snapshot_index,
            });
        }
        Ok(())
    }

    // ── Allocations ────────────────────────────────────────────────

    fn update_allocs_from_client(&mut self, updates: &[AllocClientUpdate]) -> StateResult<()> {
        for update in updates {
            let Some(mut alloc) = self.load::<Allocation>(ALLOCS, &update.alloc_id)? else {
                return Err(StateError::NotFound(format!("allocation {}", update.alloc_id)));
            };
            alloc.client_status = update.client_status;
            self.write_alloc(alloc)?;
        }
        Ok(())
    }

    /// Persist an allocation and bump the node and every claimed volume.
    fn write_alloc(&mut self, mut alloc: Allocation) -> StateResult<()> {
        alloc.modify_index = self.index;
        alloc.modify_time = self.now;
        self.put(ALLOCS, &alloc.id, &alloc)?;
        self.touch(node_touch_key(&alloc.node_id))?;
        for claim in &alloc.volume_claims {
            self.touch(volume_touch_key(&claim.volume_id))?;
        }
        self.changed.insert("allocs");
        Ok(())
    }

    // ── Host volumes ───────────────────────────────────────────────

    fn upsert_host_volumes(&mut self, volumes: Vec<HostVolume>) -> StateResult<()> {
        for mut vol in volumes {
            let key = vol.table_key();
            match self.load::<HostVolume>(HOST_VOLUMES, &key)? {
                Some(existing) => vol.create_index = existing.create_index,
                None => vol.create_index = self.index,
            }
            vol.modify_index = self.index;
            vol.allocations.clear();
            self.put(HOST_VOLUMES, &key, &vol)?;
            self.touch(volume_touch_key(&vol.id))?;
        }
        self.changed.insert("host_volumes");
        Ok(())
    }

    fn delete_host_volumes(&mut self, namespace: &str, volume_ids: &[VolumeId]) -> StateResult<()> {
        let claims: Vec<Allocation> = {
            let table = self.txn.open_table(ALLOCS).map_err(map_err!(Table))?;
            scan_keyed::<Allocation>(&table)?
                .into_values()
                .filter(Allocation::holds_claims)
                .collect()
        };

        for id in volume_ids {
            let key = volume_key(namespace, id);
            if self.load::<HostVolume>(HOST_VOLUMES, &key)?.is_none() {
                return Err(StateError::NotFound(format!("host volume {id}")));
            }
            let claimed_by: Vec<&str> = claims
                .iter()
                .filter(|a| a.volume_claims.iter().any(|c| &c.volume_id == id))
                .map(|a| a.id.as_str())
                .collect();
            if !claimed_by.is_empty() {
                return Err(StateError::Conflict(format!(
                    "volume {id} in use by allocations: [{}]",
                    claimed_by.join(", ")
                )));
            }

            let mut table = self.txn.open_table(HOST_VOLUMES).map_err(map_err!(Table))?;
            table.remove(key.as_str()).map_err(map_err!(Write))?;
            drop(table);
            self.touch(volume_touch_key(id))?;
        }
        self.changed.insert("host_volumes");
        Ok(())
    }

    // ── Table access ───────────────────────────────────────────────

    fn load<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let table = self.txn.open_table(def).map_err(map_err!(Table))?;
        read_json(&table, key)
    }

    fn put<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        table
            .insert(key, bytes.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    fn touch(&self, key: String) -> StateResult<()> {
        let mut table = self.txn.open_table(TOUCHED).map_err(map_err!(Table))?;
        table
            .insert(key.as_str(), self.index)
            .map_err(map_err!(Write))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{
        HostVolumeAccessMode, HostVolumeAttachmentMode, HostVolumeCapability, HostVolumeState,
    };
    use std::collections::BTreeMap;

    fn test_node(id: &str) -> Node {
        let mut node = Node::new(id, Resources::new(4000, 8192));
        node.status = NodeStatus::Ready;
        node
    }

    fn test_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            namespace: String::new(),
            name: String::new(),
            node_pool: String::new(),
            priority: JOB_DEFAULT_PRIORITY,
            constraints: Vec::new(),
            task_groups: vec![TaskGroup {
                name: "main".to_string(),
                count: 1,
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

    fn test_alloc(node_id: &str, eval_id: &str) -> Allocation {
        Allocation {
            id: generate_id(),
            eval_id: eval_id.to_string(),
            name: Allocation::alloc_name("web", "main", 0),
            namespace: DEFAULT_NAMESPACE.to_string(),
            job_id: "web".to_string(),
            task_group: "main".to_string(),
            node_id: node_id.to_string(),
            resources: Resources::new(500, 256),
            volume_claims: Vec::new(),
            desired_status: AllocDesiredStatus::Run,
            desired_description: String::new(),
            client_status: AllocClientStatus::Pending,
            create_index: 0,
            modify_index: 0,
            create_time: 0,
            modify_time: 0,
        }
    }

    fn test_volume(node_id: &str) -> HostVolume {
        HostVolume {
            namespace: DEFAULT_NAMESPACE.to_string(),
            id: generate_id(),
            name: "data".to_string(),
            node_id: node_id.to_string(),
            node_pool: DEFAULT_NODE_POOL.to_string(),
            requested_capabilities: vec![HostVolumeCapability::new(
                HostVolumeAttachmentMode::FileSystem,
                HostVolumeAccessMode::SingleNodeWriter,
            )],
            capacity_bytes: 1024,
            state: HostVolumeState::Ready,
            ..Default::default()
        }
    }

    fn plan_for(store: &StateStore, eval_id: &str) -> Plan {
        let mut eval = Evaluation::new(DEFAULT_NAMESPACE, "web", 50, EvalTrigger::JobRegister);
        eval.id = eval_id.to_string();
        Plan::for_eval(&eval, store.latest_index().unwrap())
    }

    #[test]
    fn test_apply_assigns_increasing_indexes() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.latest_index().unwrap(), 0);

        let first = store
            .apply(Command::UpsertNode { node: test_node("node-1") })
            .unwrap();
        let second = store
            .apply(Command::UpsertNode { node: test_node("node-2") })
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(store.latest_index().unwrap(), 2);
        assert_eq!(store.table_index("nodes").unwrap(), 2);
        assert_eq!(store.table_index("jobs").unwrap(), 0);

        let node = store.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.create_index, 1);
        assert_eq!(node.modify_index, 1);
        assert_eq!(node.node_pool, DEFAULT_NODE_POOL);
    }

    #[test]
    fn test_upsert_node_preserves_create_index_and_events() {
        let store = StateStore::open_in_memory().unwrap();
        let mut node = test_node("node-1");
        node.events.push(NodeEvent::new(NODE_EVENT_SUBSYSTEM_CLUSTER, NODE_EVENT_REGISTERED));
        store.apply(Command::UpsertNode { node }).unwrap();

        let mut again = test_node("node-1");
        again
            .events
            .push(NodeEvent::new(NODE_EVENT_SUBSYSTEM_CLUSTER, NODE_EVENT_REREGISTERED));
        store.apply(Command::UpsertNode { node: again }).unwrap();

        let node = store.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.create_index, 1);
        assert_eq!(node.modify_index, 2);
        assert_eq!(node.events.len(), 2);
        assert_eq!(node.events[0].create_index, 1);
        assert_eq!(node.events[1].create_index, 2);
    }

    #[test]
    fn test_update_node_status_appends_event() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .apply(Command::UpsertNode { node: test_node("node-1") })
            .unwrap();
        store
            .apply(Command::UpdateNodeStatus {
                node_id: "node-1".to_string(),
                status: NodeStatus::Down,
                event: Some(NodeEvent::heartbeat_missed()),
                evals: Vec::new(),
            })
            .unwrap();

        let node = store.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Down);
        assert_eq!(node.events.last().unwrap().message, NODE_EVENT_HEARTBEAT_MISSED);
        assert_eq!(node.events.last().unwrap().create_index, 2);
    }

    #[test]
    fn test_update_missing_node_is_rejected_without_advancing_index() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .apply(Command::UpdateNodeStatus {
                node_id: "ghost".to_string(),
                status: NodeStatus::Down,
                event: None,
                evals: Vec::new(),
            })
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
        assert_eq!(store.latest_index().unwrap(), 0);
    }

    #[test]
    fn test_node_events_are_capped() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .apply(Command::UpsertNode { node: test_node("node-1") })
            .unwrap();
        for _ in 0..(MAX_NODE_EVENTS + 3) {
            store
                .apply(Command::UpdateNodeEligibility {
                    node_id: "node-1".to_string(),
                    eligibility: SchedulingEligibility::Eligible,
                    event: Some(NodeEvent::new(NODE_EVENT_SUBSYSTEM_DRAIN, NODE_EVENT_DRAIN_DISABLED)),
                    evals: Vec::new(),
                })
                .unwrap();
        }
        let node = store.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.events.len(), MAX_NODE_EVENTS);
    }

    #[test]
    fn test_upsert_job_with_eval_is_atomic() {
        let store = StateStore::open_in_memory().unwrap();
        let mut job = test_job("web");
        job.canonicalize();
        let eval = Evaluation::for_job(&job, EvalTrigger::JobRegister);
        let eval_id = eval.id.clone();
        let index = store
            .apply(Command::UpsertJob { job, eval: Some(eval), check_index: None })
            .unwrap();

        let job = store.get_job(DEFAULT_NAMESPACE, "web").unwrap().unwrap();
        assert_eq!(job.modify_index, index);
        assert_eq!(job.version, 0);
        let eval = store.get_eval(&eval_id).unwrap().unwrap();
        assert_eq!(eval.create_index, index);

        store
            .apply(Command::UpsertJob { job: test_job("web"), eval: None, check_index: None })
            .unwrap();
        let job = store.get_job(DEFAULT_NAMESPACE, "web").unwrap().unwrap();
        assert_eq!(job.version, 1);
        assert_eq!(job.create_index, index);
    }

    #[test]
    fn test_upsert_job_check_index_is_enforced_in_commit() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store
            .apply(Command::UpsertJob { job: test_job("web"), eval: None, check_index: None })
            .unwrap();

        // Another writer lands between the caller's read and its commit.
        store
            .apply(Command::UpsertJob { job: test_job("web"), eval: None, check_index: None })
            .unwrap();
        let latest = store.latest_index().unwrap();

        let mut job = test_job("web");
        job.task_groups[0].count = 7;
        let err = store
            .apply(Command::UpsertJob { job: job.clone(), eval: None, check_index: Some(first) })
            .unwrap_err();
        assert!(matches!(err, StateError::Conflict(ref msg) if msg.contains("check index")));
        assert_eq!(store.latest_index().unwrap(), latest);
        assert_ne!(store.get_job(DEFAULT_NAMESPACE, "web").unwrap().unwrap().task_groups[0].count, 7);

        store
            .apply(Command::UpsertJob { job, eval: None, check_index: Some(latest) })
            .unwrap();
        assert_eq!(store.get_job(DEFAULT_NAMESPACE, "web").unwrap().unwrap().task_groups[0].count, 7);
    }

    #[test]
    fn test_upsert_and_delete_evals() {
        let store = StateStore::open_in_memory().unwrap();
        let mut eval = Evaluation::new(DEFAULT_NAMESPACE, "web", 50, EvalTrigger::JobRegister);
        store
            .apply(Command::UpsertEvals { evals: vec![eval.clone()] })
            .unwrap();

        eval.status = EvalStatus::Complete;
        store
            .apply(Command::UpsertEvals { evals: vec![eval.clone()] })
            .unwrap();
        let stored = store.get_eval(&eval.id).unwrap().unwrap();
        assert_eq!(stored.create_index, 1);
        assert_eq!(stored.modify_index, 2);
        assert_eq!(stored.status, EvalStatus::Complete);

        store
            .apply(Command::DeleteEvals { eval_ids: vec![eval.id.clone()] })
            .unwrap();
        assert!(store.get_eval(&eval.id).unwrap().is_none());
    }

    #[test]
    fn test_apply_plan_commits_allocs_and_result() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .apply(Command::UpsertNode { node: test_node("node-1") })
            .unwrap();

        let mut plan = plan_for(&store, "eval-1");
        let alloc = test_alloc("node-1", "eval-1");
        let alloc_id = alloc.id.clone();
        plan.append_alloc(alloc);
        let index = store.apply(Command::ApplyPlan { plan }).unwrap();

        let alloc = store.get_alloc(&alloc_id).unwrap().unwrap();
        assert_eq!(alloc.create_index, index);
        let result = store.get_plan_result("eval-1").unwrap().unwrap();
        assert_eq!(result.alloc_index, index);
        assert_eq!(result.placed, vec![alloc_id]);

        let snap = store.snapshot().unwrap();
        assert_eq!(snap.index(), index);
        assert_eq!(snap.node_touch_index("node-1"), index);
        assert_eq!(snap.allocs_by_node("node-1").len(), 1);
    }

    #[test]
    fn test_apply_plan_rejects_stale_node() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .apply(Command::UpsertNode { node: test_node("node-1") })
            .unwrap();

        let mut plan = plan_for(&store, "eval-1");
        plan.append_alloc(test_alloc("node-1", "eval-1"));

        // Conflicting change between snapshot and submit.
        store
            .apply(Command::UpdateNodeEligibility {
                node_id: "node-1".to_string(),
                eligibility: SchedulingEligibility::Eligible,
                event: None,
                evals: Vec::new(),
            })
            .unwrap();

        let before = store.latest_index().unwrap();
        let err = store.apply(Command::ApplyPlan { plan }).unwrap_err();
        match err {
            StateError::StalePlan {
                entity,
                modify_index,
                snapshot_index,
            } => {
                assert_eq!(entity, "node node-1");
                assert_eq!(modify_index, 2);
                assert_eq!(snapshot_index, 1);
            }
            other => panic!("expected stale plan, got {other}"),
        }
        assert_eq!(store.latest_index().unwrap(), before);
        assert!(store.allocs_by_node("node-1").unwrap().is_empty());
    }

    #[test]
    fn test_apply_plan_rejects_stale_volume() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .apply(Command::UpsertNode { node: test_node("node-1") })
            .unwrap();
        let vol = test_volume("node-1");
        store
            .apply(Command::UpsertHostVolumes { volumes: vec![vol.clone()] })
            .unwrap();

        let mut plan = plan_for(&store, "eval-1");
        let mut alloc = test_alloc("node-1", "eval-1");
        alloc.volume_claims.push(VolumeClaim {
            volume_id: vol.id.clone(),
            volume_name: vol.name.clone(),
            attachment_mode: HostVolumeAttachmentMode::FileSystem,
            access_mode: HostVolumeAccessMode::SingleNodeWriter,
            read_only: false,
        });
        plan.append_alloc(alloc);

        store
            .apply(Command::UpsertHostVolumes { volumes: vec![vol.clone()] })
            .unwrap();

        let err = store.apply(Command::ApplyPlan { plan }).unwrap_err();
        assert!(matches!(err, StateError::StalePlan { ref entity, .. } if entity.starts_with("volume")));
    }

    #[test]
    fn test_apply_plan_rejects_down_node() {
        let store = StateStore::open_in_memory().unwrap();
        let mut node = test_node("node-1");
        node.status = NodeStatus::Down;
        store.apply(Command::UpsertNode { node }).unwrap();

        let mut plan = plan_for(&store, "eval-1");
        plan.append_alloc(test_alloc("node-1", "eval-1"));
        let err = store.apply(Command::ApplyPlan { plan }).unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));
    }

    #[test]
    fn test_client_update_and_stop_release_claims() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .apply(Command::UpsertNode { node: test_node("node-1") })
            .unwrap();
        let vol = test_volume("node-1");
        store
            .apply(Command::UpsertHostVolumes { volumes: vec![vol.clone()] })
            .unwrap();

        let mut plan = plan_for(&store, "eval-1");
        let mut alloc = test_alloc("node-1", "eval-1");
        alloc.volume_claims.push(VolumeClaim {
            volume_id: vol.id.clone(),
            volume_name: vol.name.clone(),
            attachment_mode: HostVolumeAttachmentMode::FileSystem,
            access_mode: HostVolumeAccessMode::SingleNodeWriter,
            read_only: false,
        });
        let alloc_id = alloc.id.clone();
        plan.append_alloc(alloc);
        store.apply(Command::ApplyPlan { plan }).unwrap();

        let err = store
            .apply(Command::DeleteHostVolumes {
                namespace: DEFAULT_NAMESPACE.to_string(),
                volume_ids: vec![vol.id.clone()],
            })
            .unwrap_err();
        assert!(matches!(err, StateError::Conflict(ref msg) if msg.contains(&alloc_id)));

        let index = store
            .apply(Command::UpdateAllocsFromClient {
                updates: vec![AllocClientUpdate {
                    alloc_id: alloc_id.clone(),
                    client_status: AllocClientStatus::Complete,
                }],
                evals: Vec::new(),
            })
            .unwrap();
        let snap = store.snapshot().unwrap();
        assert!(snap.volume_claims(&vol.id).is_empty());
        assert_eq!(snap.volume_touch_index(&vol.id), index);

        store
            .apply(Command::DeleteHostVolumes {
                namespace: DEFAULT_NAMESPACE.to_string(),
                volume_ids: vec![vol.id.clone()],
            })
            .unwrap();
        assert!(store
            .get_host_volume(DEFAULT_NAMESPACE, &vol.id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .apply(Command::UpsertNode { node: test_node("node-1") })
            .unwrap();
        let snap = store.snapshot().unwrap();

        store
            .apply(Command::UpsertNode { node: test_node("node-2") })
            .unwrap();

        assert_eq!(snap.index(), 1);
        assert_eq!(snap.nodes().count(), 1);
        assert_eq!(store.snapshot().unwrap().nodes().count(), 2);
    }

    #[test]
    fn test_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corral.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store
                .apply(Command::UpsertNode { node: test_node("node-1") })
                .unwrap();
            store
                .apply(Command::UpsertHostVolumes { volumes: vec![test_volume("node-1")] })
                .unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.latest_index().unwrap(), 2);
        assert!(store.get_node("node-1").unwrap().is_some());
        assert_eq!(store.list_host_volumes().unwrap().len(), 1);
    }
}
