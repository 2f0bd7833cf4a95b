//! Host volumes: node-bound storage that task groups claim by name.
//!
//! A volume request goes through three steps before it is committed:
//!
//! ```text
//!   validate()                 shape of the request on its own
//!   validate_update(existing)  whether changing the stored record is safe
//!   canonicalize_for_update()  copy server-owned fields from the record
//! ```
//!
//! `allocations` is denormalized on read and never persisted.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constraint::{Constraint, ConstraintOperand};
use crate::error::ValidationError;
use crate::types::{AllocationStub, VolumeClaim, generate_id};

pub const DEFAULT_HOST_VOLUME_PLUGIN: &str = "default";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostVolumeState {
    /// Never committed.
    #[default]
    #[serde(rename = "")]
    Unknown,
    Pending,
    Ready,
    Deleted,
}

impl fmt::Display for HostVolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostVolumeState::Unknown => "unknown",
            HostVolumeState::Pending => "pending",
            HostVolumeState::Ready => "ready",
            HostVolumeState::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Storage API used to reach the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HostVolumeAttachmentMode {
    #[default]
    #[serde(rename = "")]
    Unknown,
    #[serde(rename = "block-device")]
    BlockDevice,
    #[serde(rename = "file-system")]
    FileSystem,
}

impl fmt::Display for HostVolumeAttachmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostVolumeAttachmentMode::Unknown => "",
            HostVolumeAttachmentMode::BlockDevice => "block-device",
            HostVolumeAttachmentMode::FileSystem => "file-system",
        };
        f.write_str(s)
    }
}

/// How concurrent allocations may share the volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HostVolumeAccessMode {
    #[default]
    #[serde(rename = "")]
    Unknown,
    #[serde(rename = "single-node-reader-only")]
    SingleNodeReader,
    #[serde(rename = "single-node-writer")]
    SingleNodeWriter,
    #[serde(rename = "multi-node-reader-only")]
    MultiNodeReader,
    #[serde(rename = "multi-node-single-writer")]
    MultiNodeSingleWriter,
    #[serde(rename = "multi-node-multi-writer")]
    MultiNodeMultiWriter,
}

impl HostVolumeAccessMode {
    /// A claim in this mode cannot coexist with any other claim.
    pub fn is_exclusive(self) -> bool {
        matches!(
            self,
            HostVolumeAccessMode::SingleNodeReader | HostVolumeAccessMode::SingleNodeWriter
        )
    }

    pub fn is_reader_only(self) -> bool {
        matches!(
            self,
            HostVolumeAccessMode::SingleNodeReader | HostVolumeAccessMode::MultiNodeReader
        )
    }
}

impl fmt::Display for HostVolumeAccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostVolumeAccessMode::Unknown => "",
            HostVolumeAccessMode::SingleNodeReader => "single-node-reader-only",
            HostVolumeAccessMode::SingleNodeWriter => "single-node-writer",
            HostVolumeAccessMode::MultiNodeReader => "multi-node-reader-only",
            HostVolumeAccessMode::MultiNodeSingleWriter => "multi-node-single-writer",
            HostVolumeAccessMode::MultiNodeMultiWriter => "multi-node-multi-writer",
        };
        f.write_str(s)
    }
}

/// An (attachment mode, access mode) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostVolumeCapability {
    pub attachment_mode: HostVolumeAttachmentMode,
    pub access_mode: HostVolumeAccessMode,
}

impl HostVolumeCapability {
    pub const fn new(
        attachment_mode: HostVolumeAttachmentMode,
        access_mode: HostVolumeAccessMode,
    ) -> Self {
        Self {
            attachment_mode,
            access_mode,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.attachment_mode == HostVolumeAttachmentMode::Unknown {
            return Err(format!("invalid attachment mode: {:?}", self.attachment_mode.to_string()));
        }
        if self.access_mode == HostVolumeAccessMode::Unknown {
            return Err(format!("invalid access mode: {:?}", self.access_mode.to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for HostVolumeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.attachment_mode, self.access_mode)
    }
}

/// Whether a new claim can be granted next to an existing one on the same
/// volume.
pub fn claims_conflict(existing: &VolumeClaim, new: &VolumeClaim) -> bool {
    if existing.access_mode.is_exclusive() || new.access_mode.is_exclusive() {
        return true;
    }
    let single_writer = existing.access_mode == HostVolumeAccessMode::MultiNodeSingleWriter
        || new.access_mode == HostVolumeAccessMode::MultiNodeSingleWriter;
    single_writer && !existing.read_only && !new.read_only
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostVolume {
    pub namespace: String,
    /// Server-generated UUID.
    pub id: String,
    /// Name task groups use as the volume source. Not unique.
    pub name: String,
    pub plugin_id: String,
    /// Pool of the node the volume lives on. Filled in by the server.
    pub node_pool: String,
    /// Node the volume lives on. Selected by the server when omitted.
    pub node_id: String,
    pub constraints: Vec<Constraint>,
    pub requested_capacity_min_bytes: u64,
    pub requested_capacity_max_bytes: u64,
    /// Reported by the provisioner.
    pub capacity_bytes: u64,
    pub requested_capabilities: Vec<HostVolumeCapability>,
    pub parameters: BTreeMap<String, String>,
    /// Reported by the provisioner.
    pub host_path: String,
    pub state: HostVolumeState,
    pub create_index: u64,
    pub create_time: i64,
    pub modify_index: u64,
    pub modify_time: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allocations: Vec<AllocationStub>,
}

impl HostVolume {
    /// redb key: `{namespace}/{id}`.
    pub fn table_key(&self) -> String {
        volume_key(&self.namespace, &self.id)
    }

    pub fn stub(&self) -> HostVolumeStub {
        HostVolumeStub {
            namespace: self.namespace.clone(),
            id: self.id.clone(),
            name: self.name.clone(),
            plugin_id: self.plugin_id.clone(),
            node_pool: self.node_pool.clone(),
            node_id: self.node_id.clone(),
            capacity_bytes: self.capacity_bytes,
            state: self.state,
            create_index: self.create_index,
            create_time: self.create_time,
            modify_index: self.modify_index,
            modify_time: self.modify_time,
        }
    }

    /// First requested pair, in request order, that the volume declares.
    pub fn match_capability(
        &self,
        requested: &[HostVolumeCapability],
    ) -> Option<HostVolumeCapability> {
        if requested.is_empty() {
            return self.requested_capabilities.first().copied();
        }
        requested
            .iter()
            .find(|want| self.requested_capabilities.contains(want))
            .copied()
    }

    /// Checks the request on its own, without looking at stored state.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut err = ValidationError::default();

        if !self.id.is_empty() && uuid::Uuid::parse_str(&self.id).is_err() {
            err.push("invalid ID");
        }
        if self.name.is_empty() {
            err.push("missing name");
        }
        if self.requested_capacity_max_bytes < self.requested_capacity_min_bytes {
            err.push(format!(
                "capacity_max ({}) must be larger than capacity_min ({})",
                self.requested_capacity_max_bytes, self.requested_capacity_min_bytes
            ));
        }

        if self.requested_capabilities.is_empty() {
            err.push("must include at least one capability block");
        } else {
            for cap in &self.requested_capabilities {
                if let Err(e) = cap.validate() {
                    err.push(e);
                }
            }
        }

        for constraint in &self.constraints {
            if let Err(e) = constraint.validate() {
                err.push(format!("invalid constraint: {e}"));
            }
            if matches!(
                constraint.operand,
                ConstraintOperand::DistinctHosts | ConstraintOperand::DistinctProperty
            ) {
                err.push(format!(
                    "invalid constraint {}: host volumes of the same name are always on distinct hosts",
                    constraint.operand
                ));
            }
        }

        err.into_result()
    }

    /// Checks whether replacing `existing` with `self` is safe. `existing`
    /// must carry its denormalized claims.
    pub fn validate_update(&self, existing: Option<&HostVolume>) -> Result<(), ValidationError> {
        let Some(existing) = existing else {
            return Ok(());
        };
        let mut err = ValidationError::default();

        if !existing.allocations.is_empty() {
            let ids: Vec<&str> = existing.allocations.iter().map(|a| a.id.as_str()).collect();
            err.push(format!(
                "cannot update a volume in use: claimed by allocs ({})",
                ids.join(", ")
            ));
        }
        if !self.node_id.is_empty() && self.node_id != existing.node_id {
            err.push("node ID cannot be updated");
        }
        if !self.node_pool.is_empty() && self.node_pool != existing.node_pool {
            err.push("node pool cannot be updated");
        }
        if self.requested_capacity_max_bytes < existing.capacity_bytes {
            err.push(format!(
                "capacity_max ({}) cannot be less than existing provisioned capacity ({})",
                self.requested_capacity_max_bytes, existing.capacity_bytes
            ));
        }

        err.into_result()
    }

    /// Fill server-owned fields. Call on a request copy, never on a stored
    /// record.
    pub fn canonicalize_for_update(&mut self, existing: Option<&HostVolume>, now: i64) {
        match existing {
            None => {
                self.id = generate_id();
                if self.plugin_id.is_empty() {
                    self.plugin_id = DEFAULT_HOST_VOLUME_PLUGIN.to_string();
                }
                self.capacity_bytes = 0;
                self.host_path.clear();
                self.create_time = now;
            }
            Some(existing) => {
                self.plugin_id = existing.plugin_id.clone();
                self.node_pool = existing.node_pool.clone();
                self.node_id = existing.node_id.clone();
                self.constraints = existing.constraints.clone();
                self.capacity_bytes = existing.capacity_bytes;
                self.host_path = existing.host_path.clone();
                self.create_time = existing.create_time;
            }
        }

        self.state = HostVolumeState::Pending;
        self.modify_time = now;
        self.allocations.clear();
    }
}

pub fn volume_key(namespace: &str, id: &str) -> String {
    format!("{namespace}/{id}")
}

/// List projection of a [`HostVolume`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostVolumeStub {
    pub namespace: String,
    pub id: String,
    pub name: String,
    pub plugin_id: String,
    pub node_pool: String,
    pub node_id: String,
    pub capacity_bytes: u64,
    pub state: HostVolumeState,
    pub create_index: u64,
    pub create_time: i64,
    pub modify_index: u64,
    pub modify_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AllocClientStatus, AllocDesiredStatus};

    fn fs_writer() -> HostVolumeCapability {
        HostVolumeCapability::new(
            HostVolumeAttachmentMode::FileSystem,
            HostVolumeAccessMode::SingleNodeWriter,
        )
    }

    fn test_volume() -> HostVolume {
        HostVolume {
            namespace: "default".to_string(),
            name: "db-data".to_string(),
            requested_capacity_min_bytes: 100,
            requested_capacity_max_bytes: 200,
            requested_capabilities: vec![fs_writer()],
            ..Default::default()
        }
    }

    fn stub(id: &str) -> AllocationStub {
        AllocationStub {
            id: id.to_string(),
            name: "db.main[0]".to_string(),
            namespace: "default".to_string(),
            job_id: "db".to_string(),
            task_group: "main".to_string(),
            node_id: "node-1".to_string(),
            desired_status: AllocDesiredStatus::Run,
            client_status: AllocClientStatus::Running,
            create_index: 1,
            modify_index: 1,
        }
    }

    fn claim(access_mode: HostVolumeAccessMode, read_only: bool) -> VolumeClaim {
        VolumeClaim {
            volume_id: "vol".to_string(),
            volume_name: "data".to_string(),
            attachment_mode: HostVolumeAttachmentMode::FileSystem,
            access_mode,
            read_only,
        }
    }

    #[test]
    fn test_validate_ok_with_single_capability() {
        test_volume().validate().unwrap();
    }

    #[test]
    fn test_validate_capacity_ordering() {
        let mut vol = test_volume();
        vol.requested_capacity_min_bytes = 10;
        vol.requested_capacity_max_bytes = 5;
        let err = vol.validate().unwrap_err();
        assert_eq!(err.errors.len(), 1);
        assert!(err.errors[0].contains("capacity_max (5) must be larger than capacity_min (10)"));
    }

    #[test]
    fn test_validate_missing_capability() {
        let mut vol = test_volume();
        vol.requested_capabilities.clear();
        let err = vol.validate().unwrap_err();
        assert!(err.to_string().contains("must include at least one capability block"));
    }

    #[test]
    fn test_validate_aggregates_problems() {
        let vol = HostVolume {
            id: "not-a-uuid".to_string(),
            requested_capacity_min_bytes: 10,
            requested_capacity_max_bytes: 5,
            requested_capabilities: vec![HostVolumeCapability::default()],
            constraints: vec![Constraint::new("", ConstraintOperand::DistinctHosts, "")],
            ..Default::default()
        };
        let err = vol.validate().unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("5 errors occurred"), "{text}");
        assert!(text.contains("invalid ID"));
        assert!(text.contains("missing name"));
        assert!(text.contains("invalid attachment mode"));
        assert!(text.contains("always on distinct hosts"));
    }

    #[test]
    fn test_unknown_mode_deserializes_then_fails_validation() {
        let cap: HostVolumeCapability =
            serde_json::from_str(r#"{"attachment_mode":"file-system","access_mode":""}"#).unwrap();
        let err = cap.validate().unwrap_err();
        assert!(err.contains("invalid access mode"));
    }

    #[test]
    fn test_validate_update_rejects_claimed_volume() {
        let mut existing = test_volume();
        existing.id = generate_id();
        existing.node_id = "node-1".to_string();
        existing.node_pool = "default".to_string();
        existing.allocations = vec![stub("alloc-1")];

        let update = existing.clone();
        let err = update.validate_update(Some(&existing)).unwrap_err();
        assert_eq!(err.errors, vec!["cannot update a volume in use: claimed by allocs (alloc-1)"]);
    }

    #[test]
    fn test_validate_update_rejects_node_and_pool_changes() {
        let mut existing = test_volume();
        existing.node_id = "node-1".to_string();
        existing.node_pool = "default".to_string();

        let mut update = test_volume();
        update.node_id = "node-2".to_string();
        let err = update.validate_update(Some(&existing)).unwrap_err();
        assert_eq!(err.errors, vec!["node ID cannot be updated"]);

        let mut update = test_volume();
        update.node_pool = "gpu".to_string();
        let err = update.validate_update(Some(&existing)).unwrap_err();
        assert_eq!(err.errors, vec!["node pool cannot be updated"]);

        // Leaving node fields empty means "keep".
        test_volume().validate_update(Some(&existing)).unwrap();
        test_volume().validate_update(None).unwrap();
    }

    #[test]
    fn test_validate_update_capacity_below_provisioned() {
        let mut existing = test_volume();
        existing.capacity_bytes = 150;
        let mut update = test_volume();
        update.requested_capacity_max_bytes = 120;
        let err = update.validate_update(Some(&existing)).unwrap_err();
        assert!(err.errors[0].contains("cannot be less than existing provisioned capacity (150)"));
    }

    #[test]
    fn test_canonicalize_new_volume() {
        let mut vol = test_volume();
        vol.capacity_bytes = 999;
        vol.host_path = "/client/set".to_string();
        vol.allocations = vec![stub("a")];
        vol.canonicalize_for_update(None, 42);

        assert!(uuid::Uuid::parse_str(&vol.id).is_ok());
        assert_eq!(vol.plugin_id, DEFAULT_HOST_VOLUME_PLUGIN);
        assert_eq!(vol.capacity_bytes, 0);
        assert!(vol.host_path.is_empty());
        assert_eq!(vol.create_time, 42);
        assert_eq!(vol.modify_time, 42);
        assert_eq!(vol.state, HostVolumeState::Pending);
        assert!(vol.allocations.is_empty());
    }

    #[test]
    fn test_canonicalize_update_keeps_server_fields() {
        let mut existing = test_volume();
        existing.id = generate_id();
        existing.plugin_id = "lvm".to_string();
        existing.node_id = "node-1".to_string();
        existing.node_pool = "default".to_string();
        existing.capacity_bytes = 150;
        existing.host_path = "/var/corral/volumes/x".to_string();
        existing.create_time = 7;
        existing.state = HostVolumeState::Ready;

        let mut update = test_volume();
        update.id = existing.id.clone();
        update.requested_capacity_max_bytes = 300;
        update.canonicalize_for_update(Some(&existing), 99);

        assert_eq!(update.id, existing.id);
        assert_eq!(update.plugin_id, "lvm");
        assert_eq!(update.node_id, "node-1");
        assert_eq!(update.capacity_bytes, 150);
        assert_eq!(update.host_path, existing.host_path);
        assert_eq!(update.create_time, 7);
        assert_eq!(update.modify_time, 99);
        assert_eq!(update.requested_capacity_max_bytes, 300);
        assert_eq!(update.state, HostVolumeState::Pending);
    }

    #[test]
    fn test_match_capability_any_pair() {
        let mut vol = test_volume();
        vol.requested_capabilities = vec![
            HostVolumeCapability::new(
                HostVolumeAttachmentMode::BlockDevice,
                HostVolumeAccessMode::SingleNodeWriter,
            ),
            HostVolumeCapability::new(
                HostVolumeAttachmentMode::FileSystem,
                HostVolumeAccessMode::MultiNodeReader,
            ),
        ];
        let want = [
            HostVolumeCapability::new(
                HostVolumeAttachmentMode::FileSystem,
                HostVolumeAccessMode::MultiNodeMultiWriter,
            ),
            HostVolumeCapability::new(
                HostVolumeAttachmentMode::FileSystem,
                HostVolumeAccessMode::MultiNodeReader,
            ),
        ];
        assert_eq!(vol.match_capability(&want), Some(want[1]));
        assert_eq!(vol.match_capability(&want[..1]), None);
        assert_eq!(vol.match_capability(&[]), Some(vol.requested_capabilities[0]));
    }

    #[test]
    fn test_claim_conflicts() {
        use HostVolumeAccessMode::*;
        assert!(claims_conflict(&claim(SingleNodeWriter, false), &claim(MultiNodeMultiWriter, false)));
        assert!(claims_conflict(&claim(MultiNodeReader, true), &claim(SingleNodeReader, true)));
        assert!(claims_conflict(&claim(MultiNodeSingleWriter, false), &claim(MultiNodeSingleWriter, false)));
        assert!(!claims_conflict(&claim(MultiNodeSingleWriter, false), &claim(MultiNodeSingleWriter, true)));
        assert!(!claims_conflict(&claim(MultiNodeReader, true), &claim(MultiNodeReader, true)));
        assert!(!claims_conflict(&claim(MultiNodeMultiWriter, false), &claim(MultiNodeMultiWriter, false)));
    }

    #[test]
    fn test_stub_projection() {
        let mut vol = test_volume();
        vol.id = generate_id();
        vol.state = HostVolumeState::Ready;
        let s = vol.stub();
        assert_eq!(s.id, vol.id);
        assert_eq!(s.state, HostVolumeState::Ready);
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("requested_capabilities"));
    }
}
