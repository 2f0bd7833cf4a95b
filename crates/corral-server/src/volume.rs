//! Host volume endpoints.
//!
//! `create` asks the provisioner to make the volume, picking a node when
//! the request names none. `register` records a volume that already exists
//! on a node. Both run the same checks before anything is committed:
//!
//! ```text
//! validate ─► validate_update(existing + live claims) ─► canonicalize_for_update
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use corral_placement::{PlacementError, check_volume_node, select_volume_node};
use corral_state::{
    Allocation, Command, DEFAULT_NAMESPACE, HostVolume, HostVolumeState, HostVolumeStub,
    NodeStatus, StateError, StateSnapshot, ValidationError, now_nanos,
};

use crate::error::{ServerError, ServerResult};
use crate::server::Server;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeWriteResponse {
    pub volumes: Vec<HostVolume>,
    pub index: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDeleteResponse {
    pub deleted: Vec<String>,
    /// Volume ID → why it was not deleted.
    pub errors: BTreeMap<String, String>,
    pub index: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeListRequest {
    /// `None` or `"*"` lists every namespace.
    pub namespace: Option<String>,
    pub node_id: Option<String>,
    pub node_pool: Option<String>,
    pub per_page: Option<usize>,
    /// ID of the first volume to return.
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeListResponse {
    pub volumes: Vec<HostVolumeStub>,
    pub next_token: Option<String>,
    /// Index of the last host volume write.
    pub index: u64,
}

impl Server {
    pub async fn create_volumes(&self, volumes: Vec<HostVolume>) -> ServerResult<VolumeWriteResponse> {
        self.ensure_leader()?;
        if volumes.is_empty() {
            return Err(ServerError::invalid("missing volume definition"));
        }
        let snapshot = self.inner.state.snapshot()?;
        let now = now_nanos();

        let mut prepared = Vec::with_capacity(volumes.len());
        for mut vol in volumes {
            default_namespace(&mut vol);
            vol.validate()?;
            let existing = existing_volume(&snapshot, &vol)?;
            vol.validate_update(existing.as_ref())?;
            vol.canonicalize_for_update(existing.as_ref(), now);
            if existing.is_none() {
                place_volume(&snapshot, &mut vol)?;
            }
            prepared.push(vol);
        }

        for vol in &mut prepared {
            let provisioned = self
                .inner
                .provisioner
                .create(vol.clone())
                .await
                .map_err(ServerError::Provisioner)?;
            vol.host_path = provisioned.host_path;
            vol.capacity_bytes = provisioned.capacity_bytes;
            vol.state = HostVolumeState::Ready;
        }

        self.commit_volumes(prepared)
    }

    pub async fn register_volumes(&self, volumes: Vec<HostVolume>) -> ServerResult<VolumeWriteResponse> {
        self.ensure_leader()?;
        if volumes.is_empty() {
            return Err(ServerError::invalid("missing volume definition"));
        }
        let snapshot = self.inner.state.snapshot()?;
        let now = now_nanos();

        let mut prepared = Vec::with_capacity(volumes.len());
        for mut vol in volumes {
            default_namespace(&mut vol);
            validate_registration(&vol)?;
            let existing = existing_volume(&snapshot, &vol)?;
            vol.validate_update(existing.as_ref())?;

            let (host_path, capacity_bytes) = (vol.host_path.clone(), vol.capacity_bytes);
            vol.canonicalize_for_update(existing.as_ref(), now);
            vol.host_path = host_path;
            vol.capacity_bytes = capacity_bytes;

            let node = snapshot
                .node_by_id(&vol.node_id)
                .ok_or_else(|| ServerError::NotFound(format!("node {}", vol.node_id)))?;
            if !vol.node_pool.is_empty() && vol.node_pool != node.node_pool {
                return Err(ServerError::invalid(format!(
                    "node pool {:?} does not match node {}'s pool {:?}",
                    vol.node_pool, node.id, node.node_pool
                )));
            }
            vol.node_pool = node.node_pool.clone();
            vol.state = if node.status == NodeStatus::Ready {
                HostVolumeState::Ready
            } else {
                HostVolumeState::Pending
            };
            prepared.push(vol);
        }

        self.commit_volumes(prepared)
    }

    /// Delete volumes that no live allocation claims. Volumes that cannot be
    /// deleted are reported per ID; the rest still go.
    pub async fn delete_volumes(&self, namespace: &str, ids: Vec<String>) -> ServerResult<VolumeDeleteResponse> {
        self.ensure_leader()?;
        let namespace = if namespace.is_empty() { DEFAULT_NAMESPACE } else { namespace };
        let snapshot = self.inner.state.snapshot()?;

        let mut resp = VolumeDeleteResponse::default();
        for id in ids {
            let Some(vol) = snapshot.host_volume_by_id(namespace, &id) else {
                resp.errors.insert(id, "volume not found".to_string());
                continue;
            };
            let claims = snapshot.volume_claims(&id);
            if !claims.is_empty() {
                let alloc_ids: Vec<&str> = claims.iter().map(|a| a.id.as_str()).collect();
                resp.errors.insert(
                    id,
                    format!("volume in use by allocations: [{}]", alloc_ids.join(", ")),
                );
                continue;
            }
            // The store re-checks claims in the deleting transaction, so a
            // claim committed after the snapshot keeps the volume and its
            // storage.
            let index = match self.inner.state.apply(Command::DeleteHostVolumes {
                namespace: namespace.to_string(),
                volume_ids: vec![id.clone()],
            }) {
                Ok(index) => index,
                Err(e @ (StateError::Conflict(_) | StateError::NotFound(_))) => {
                    resp.errors.insert(id, e.to_string());
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            resp.index = Some(index);
            if let Err(e) = self.inner.provisioner.delete(vol.clone()).await {
                warn!(volume_id = %id, index, error = %e, "provisioner failed to delete volume storage");
                resp.errors.insert(id, format!("volume deleted but storage cleanup failed: {e}"));
                continue;
            }
            info!(volume_id = %id, index, "host volume deleted");
            resp.deleted.push(id);
        }
        Ok(resp)
    }

    /// A volume with its live claims filled in.
    pub fn get_volume(&self, namespace: &str, id: &str) -> ServerResult<HostVolume> {
        let snapshot = self.inner.state.snapshot()?;
        snapshot
            .host_volume_by_id(namespace, id)
            .map(|vol| with_claims(&snapshot, vol))
            .ok_or_else(|| ServerError::NotFound(format!("host volume {id}")))
    }

    pub fn list_volumes(&self, req: &VolumeListRequest) -> ServerResult<VolumeListResponse> {
        let index = self.inner.state.table_index("host_volumes")?;
        let mut volumes: Vec<HostVolume> = self
            .inner
            .state
            .list_host_volumes()?
            .into_iter()
            .filter(|v| match req.namespace.as_deref() {
                None | Some("*") => true,
                Some(ns) => v.namespace == ns,
            })
            .filter(|v| req.node_id.as_deref().is_none_or(|id| v.node_id == id))
            .filter(|v| req.node_pool.as_deref().is_none_or(|pool| v.node_pool == pool))
            .filter(|v| req.next_token.as_deref().is_none_or(|token| v.id.as_str() >= token))
            .collect();
        volumes.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.namespace.cmp(&b.namespace)));

        let mut next_token = None;
        if let Some(per_page) = req.per_page.filter(|n| *n > 0) {
            if volumes.len() > per_page {
                next_token = Some(volumes[per_page].id.clone());
                volumes.truncate(per_page);
            }
        }

        Ok(VolumeListResponse {
            volumes: volumes.iter().map(HostVolume::stub).collect(),
            next_token,
            index,
        })
    }

    fn commit_volumes(&self, volumes: Vec<HostVolume>) -> ServerResult<VolumeWriteResponse> {
        let keys: Vec<(String, String)> = volumes
            .iter()
            .map(|v| (v.namespace.clone(), v.id.clone()))
            .collect();
        let index = self
            .inner
            .state
            .apply(Command::UpsertHostVolumes { volumes })?;
        for (namespace, id) in &keys {
            info!(%namespace, volume_id = %id, index, "host volume committed");
        }
        self.inner.dispatch.unblock(index)?;

        let mut stored = Vec::with_capacity(keys.len());
        for (namespace, id) in keys {
            if let Some(vol) = self.inner.state.get_host_volume(&namespace, &id)? {
                stored.push(vol);
            }
        }
        Ok(VolumeWriteResponse {
            volumes: stored,
            index,
        })
    }
}

fn default_namespace(vol: &mut HostVolume) {
    if vol.namespace.is_empty() {
        vol.namespace = DEFAULT_NAMESPACE.to_string();
    }
}

fn validate_registration(vol: &HostVolume) -> Result<(), ValidationError> {
    let mut err = vol.validate().err().unwrap_or_default();
    if vol.node_id.is_empty() {
        err.push("missing node ID");
    }
    if vol.host_path.is_empty() {
        err.push("missing host path");
    }
    err.into_result()
}

fn with_claims(snapshot: &StateSnapshot, vol: &HostVolume) -> HostVolume {
    let mut vol = vol.clone();
    vol.allocations = snapshot
        .volume_claims(&vol.id)
        .into_iter()
        .map(Allocation::stub)
        .collect();
    vol
}

fn existing_volume(snapshot: &StateSnapshot, vol: &HostVolume) -> ServerResult<Option<HostVolume>> {
    if vol.id.is_empty() {
        return Ok(None);
    }
    snapshot
        .host_volume_by_id(&vol.namespace, &vol.id)
        .map(|existing| Some(with_claims(snapshot, existing)))
        .ok_or_else(|| {
            ServerError::NotFound(format!("cannot update host volume {}: it does not exist", vol.id))
        })
}

/// Fix the node and pool of a new volume.
fn place_volume(snapshot: &StateSnapshot, vol: &mut HostVolume) -> ServerResult<()> {
    if vol.node_id.is_empty() {
        vol.node_id = select_volume_node(snapshot, vol)?;
    } else {
        let node = snapshot
            .node_by_id(&vol.node_id)
            .ok_or_else(|| PlacementError::NodeNotFound(vol.node_id.clone()))?;
        if vol.node_pool.is_empty() {
            vol.node_pool = node.node_pool.clone();
        }
        check_volume_node(snapshot, node, vol).map_err(|reason| PlacementError::NodeIneligible {
            node_id: node.id.clone(),
            reason,
        })?;
    }
    if let Some(node) = snapshot.node_by_id(&vol.node_id) {
        vol.node_pool = node.node_pool.clone();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use corral_core::ServerConfig;
    use corral_state::{
        AllocClientStatus, AllocDesiredStatus, HostVolumeAccessMode, HostVolumeAttachmentMode,
        HostVolumeCapability, Node, Plan, EvalTrigger, Evaluation, Resources, StateStore,
        VolumeClaim, generate_id,
    };

    use crate::provisioner::{BoxFuture, ProvisionedVolume, StaticProvisioner, VolumeProvisioner};

    const BLOCK_WRITER: HostVolumeCapability = HostVolumeCapability::new(
        HostVolumeAttachmentMode::BlockDevice,
        HostVolumeAccessMode::SingleNodeWriter,
    );

    async fn leader() -> Server {
        let mut config = ServerConfig::default();
        config.scheduler.num_schedulers = 0;
        let server = Server::new(config, StateStore::open_in_memory().unwrap());
        server.establish_leadership().await.unwrap();
        server
    }

    fn add_node(server: &Server, id: &str, status: NodeStatus) {
        let mut node = Node::new(id, Resources::new(1000, 1024));
        node.status = status;
        server.state().apply(Command::UpsertNode { node }).unwrap();
    }

    fn request(name: &str) -> HostVolume {
        HostVolume {
            name: name.to_string(),
            requested_capacity_min_bytes: 100,
            requested_capacity_max_bytes: 200,
            requested_capabilities: vec![BLOCK_WRITER],
            ..HostVolume::default()
        }
    }

    fn claim(server: &Server, vol: &HostVolume) -> String {
        claim_in(server.state(), vol)
    }

    fn claim_in(state: &StateStore, vol: &HostVolume) -> String {
        let eval = Evaluation::new("default", "db", 50, EvalTrigger::JobRegister);
        let index = state.latest_index().unwrap();
        let mut plan = Plan::for_eval(&eval, index);
        let alloc_id = generate_id();
        plan.append_alloc(Allocation {
            id: alloc_id.clone(),
            eval_id: eval.id.clone(),
            name: Allocation::alloc_name("db", "db", 0),
            namespace: "default".into(),
            job_id: "db".into(),
            task_group: "db".into(),
            node_id: vol.node_id.clone(),
            resources: Resources::new(100, 100),
            volume_claims: vec![VolumeClaim {
                volume_id: vol.id.clone(),
                volume_name: vol.name.clone(),
                attachment_mode: HostVolumeAttachmentMode::BlockDevice,
                access_mode: HostVolumeAccessMode::SingleNodeWriter,
                read_only: false,
            }],
            desired_status: AllocDesiredStatus::Run,
            desired_description: String::new(),
            client_status: AllocClientStatus::Running,
            create_index: 0,
            modify_index: 0,
            create_time: 0,
            modify_time: 0,
        });
        state.apply(Command::ApplyPlan { plan }).unwrap();
        alloc_id
    }

    /// Claims `target` the first time any volume's storage is deleted.
    struct ClaimOnDelete {
        state: StateStore,
        target: Mutex<Option<HostVolume>>,
        deletes: AtomicUsize,
    }

    impl VolumeProvisioner for ClaimOnDelete {
        fn create(&self, volume: HostVolume) -> BoxFuture<Result<ProvisionedVolume, String>> {
            StaticProvisioner::default().create(volume)
        }

        fn delete(&self, _volume: HostVolume) -> BoxFuture<Result<(), String>> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            if let Some(target) = self.target.lock().unwrap().take() {
                claim_in(&self.state, &target);
            }
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn test_create_selects_node_and_provisions() {
        let server = leader().await;
        add_node(&server, "n1", NodeStatus::Ready);
        add_node(&server, "n2", NodeStatus::Initializing);

        let resp = server.create_volumes(vec![request("data")]).await.unwrap();
        let vol = &resp.volumes[0];
        assert_eq!(vol.node_id, "n1");
        assert_eq!(vol.node_pool, "default");
        assert_eq!(vol.state, HostVolumeState::Ready);
        assert_eq!(vol.capacity_bytes, 200);
        assert!(vol.host_path.ends_with(&vol.id));
        assert_eq!(vol.create_index, resp.index);

        // A second volume of the same name has nowhere to go.
        let err = server.create_volumes(vec![request("data")]).await.unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)), "{err}");
    }

    #[tokio::test]
    async fn test_create_validates_every_problem() {
        let server = leader().await;
        let mut bad = request("");
        bad.requested_capacity_min_bytes = 10;
        bad.requested_capacity_max_bytes = 5;
        bad.requested_capabilities.clear();
        match server.create_volumes(vec![bad]).await.unwrap_err() {
            ServerError::Validation(v) => assert_eq!(v.errors.len(), 3),
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_register_state_follows_node() {
        let server = leader().await;
        add_node(&server, "n1", NodeStatus::Initializing);

        let mut req = request("data");
        let err = server.register_volumes(vec![req.clone()]).await.unwrap_err();
        match err {
            ServerError::Validation(v) => assert_eq!(v.errors.len(), 2),
            other => panic!("unexpected error {other}"),
        }

        req.node_id = "n1".into();
        req.host_path = "/srv/data".into();
        req.capacity_bytes = 150;
        let vol = server.register_volumes(vec![req]).await.unwrap().volumes.remove(0);
        assert_eq!(vol.state, HostVolumeState::Pending);
        assert_eq!(vol.host_path, "/srv/data");
        assert_eq!(vol.capacity_bytes, 150);
    }

    #[tokio::test]
    async fn test_update_rejected_while_claimed() {
        let server = leader().await;
        add_node(&server, "n1", NodeStatus::Ready);
        let vol = server.create_volumes(vec![request("data")]).await.unwrap().volumes.remove(0);
        let alloc_id = claim(&server, &vol);

        let got = server.get_volume("default", &vol.id).unwrap();
        assert_eq!(got.allocations.len(), 1);
        assert_eq!(got.allocations[0].id, alloc_id);

        let mut update = request("data");
        update.id = vol.id.clone();
        update.node_id = "n2".into();
        match server.create_volumes(vec![update]).await.unwrap_err() {
            ServerError::Validation(v) => {
                assert_eq!(v.errors.len(), 2);
                assert!(v.errors[0].contains("in use"));
            }
            other => panic!("unexpected error {other}"),
        }

        let resp = server.delete_volumes("default", vec![vol.id.clone(), "missing".into()]).await.unwrap();
        assert!(resp.deleted.is_empty());
        assert_eq!(resp.errors.len(), 2);
        assert!(resp.index.is_none());

        server
            .update_allocs(vec![corral_state::AllocClientUpdate {
                alloc_id,
                client_status: AllocClientStatus::Complete,
            }])
            .await
            .unwrap();
        let resp = server.delete_volumes("default", vec![vol.id.clone()]).await.unwrap();
        assert_eq!(resp.deleted, vec![vol.id.clone()]);
        assert!(matches!(
            server.get_volume("default", &vol.id),
            Err(ServerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_keeps_volume_claimed_after_snapshot() {
        let state = StateStore::open_in_memory().unwrap();
        let provisioner = Arc::new(ClaimOnDelete {
            state: state.clone(),
            target: Mutex::new(None),
            deletes: AtomicUsize::new(0),
        });
        let mut config = ServerConfig::default();
        config.scheduler.num_schedulers = 0;
        let server = Server::with_provisioner(config, state, provisioner.clone());
        server.establish_leadership().await.unwrap();
        add_node(&server, "n1", NodeStatus::Ready);
        add_node(&server, "n2", NodeStatus::Ready);

        let mut first = request("scratch");
        first.node_id = "n1".into();
        let mut second = request("data");
        second.node_id = "n2".into();
        let resp = server.create_volumes(vec![first, second]).await.unwrap();
        let by_name = |name: &str| resp.volumes.iter().find(|v| v.name == name).unwrap().clone();
        let (first, second) = (by_name("scratch"), by_name("data"));
        *provisioner.target.lock().unwrap() = Some(second.clone());

        // Deleting the first volume's storage races a claim on the second.
        let resp = server
            .delete_volumes("default", vec![first.id.clone(), second.id.clone()])
            .await
            .unwrap();
        assert_eq!(resp.deleted, vec![first.id.clone()]);
        assert!(resp.errors[&second.id].contains("in use"), "{:?}", resp.errors);
        assert_eq!(provisioner.deletes.load(Ordering::SeqCst), 1);

        let kept = server.get_volume("default", &second.id).unwrap();
        assert_eq!(kept.state, HostVolumeState::Ready);
        assert_eq!(kept.allocations.len(), 1);
        assert!(matches!(
            server.get_volume("default", &first.id),
            Err(ServerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters_and_paginates() {
        let server = leader().await;
        add_node(&server, "n1", NodeStatus::Ready);
        add_node(&server, "n2", NodeStatus::Ready);
        add_node(&server, "n3", NodeStatus::Ready);
        for name in ["a", "b", "c"] {
            server.create_volumes(vec![request(name)]).await.unwrap();
        }

        let all = server.list_volumes(&VolumeListRequest::default()).unwrap();
        assert_eq!(all.volumes.len(), 3);
        assert!(all.index > 0);
        let ids: Vec<String> = all.volumes.iter().map(|v| v.id.clone()).collect();
        let sorted = {
            let mut s = ids.clone();
            s.sort();
            s
        };
        assert_eq!(ids, sorted);

        let page = server
            .list_volumes(&VolumeListRequest {
                per_page: Some(2),
                ..VolumeListRequest::default()
            })
            .unwrap();
        assert_eq!(page.volumes.len(), 2);
        let token = page.next_token.unwrap();
        assert_eq!(token, ids[2]);
        let rest = server
            .list_volumes(&VolumeListRequest {
                next_token: Some(token),
                ..VolumeListRequest::default()
            })
            .unwrap();
        assert_eq!(rest.volumes.len(), 1);
        assert!(rest.next_token.is_none());

        let on_n1 = server
            .list_volumes(&VolumeListRequest {
                node_id: Some("n1".into()),
                ..VolumeListRequest::default()
            })
            .unwrap();
        assert!(on_n1.volumes.iter().all(|v| v.node_id == "n1"));

        let other_ns = server
            .list_volumes(&VolumeListRequest {
                namespace: Some("prod".into()),
                ..VolumeListRequest::default()
            })
            .unwrap();
        assert!(other_ns.volumes.is_empty());
    }
}
