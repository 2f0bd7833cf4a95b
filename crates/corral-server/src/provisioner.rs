//! Host volume provisioning boundary.
//!
//! The server never creates storage itself. `Volume.Create` hands the
//! canonicalized request to a [`VolumeProvisioner`], which reports where
//! the volume lives and how big it turned out to be.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use corral_state::HostVolume;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Facts reported back by the provider once a volume exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedVolume {
    pub host_path: String,
    pub capacity_bytes: u64,
}

/// External capability provider for host volumes.
pub trait VolumeProvisioner: Send + Sync {
    /// Create (or resize) `volume` on `volume.node_id`.
    fn create(&self, volume: HostVolume) -> BoxFuture<Result<ProvisionedVolume, String>>;

    /// Remove a volume's storage from its node.
    fn delete(&self, volume: HostVolume) -> BoxFuture<Result<(), String>>;
}

/// Provisions nothing: every volume lands under a fixed root and gets the
/// largest capacity its request allows.
#[derive(Debug, Clone)]
pub struct StaticProvisioner {
    root: String,
}

impl StaticProvisioner {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for StaticProvisioner {
    fn default() -> Self {
        Self::new("/var/lib/corral/host_volumes")
    }
}

impl VolumeProvisioner for StaticProvisioner {
    fn create(&self, volume: HostVolume) -> BoxFuture<Result<ProvisionedVolume, String>> {
        let host_path = format!("{}/{}", self.root.trim_end_matches('/'), volume.id);
        let capacity_bytes = volume
            .requested_capacity_max_bytes
            .max(volume.requested_capacity_min_bytes);
        Box::pin(async move {
            Ok(ProvisionedVolume {
                host_path,
                capacity_bytes,
            })
        })
    }

    fn delete(&self, _volume: HostVolume) -> BoxFuture<Result<(), String>> {
        Box::pin(async { Ok(()) })
    }
}
