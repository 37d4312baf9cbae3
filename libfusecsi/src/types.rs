//! Core CSI node types: volume identity, lifecycle requests, capabilities.
//!
//! Requests are constructed per call by whatever transport embeds this crate
//! and are never persisted.  They are all [`Serialize`]/[`Deserialize`] so a
//! transport can carry them as-is.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::CsiError;

/// Volume context / storage class parameter naming the owning cluster.
pub const CTX_CLUSTER_NAME: &str = "clusterName";

/// Volume context / storage class parameter naming the owning cluster's
/// namespace.
pub const CTX_CLUSTER_NAMESPACE: &str = "clusterNamespace";

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, globally unique identifier for a volume (the persistent volume
/// name, e.g. `pvc-5f1c...`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl VolumeId {
    /// The last `-`-separated segment of the identifier.
    ///
    /// `pvc-123` yields `123`; an identifier without dashes yields itself.
    pub fn last_segment(&self) -> &str {
        self.0.rsplit('-').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Owning cluster
// ---------------------------------------------------------------------------

/// Name and namespace of the distributed-filesystem cluster backing a volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterRef {
    pub name: String,
    pub namespace: String,
}

impl ClusterRef {
    /// Extract the cluster reference from a volume context or storage class
    /// parameter map.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, CsiError> {
        let lookup = |key: &str| {
            params
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| CsiError::InvalidArgument(format!("missing parameter {key}")))
        };
        Ok(Self {
            name: lookup(CTX_CLUSTER_NAME)?,
            namespace: lookup(CTX_CLUSTER_NAMESPACE)?,
        })
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to stage a volume: bring up the bridge pod that FUSE-mounts the
/// remote filesystem at the node-global staging path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Node-local mount point shared by every container using the volume.
    pub staging_target_path: String,
    /// Opaque context carrying [`CTX_CLUSTER_NAME`] and
    /// [`CTX_CLUSTER_NAMESPACE`].
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

impl NodeStageVolumeRequest {
    /// The cluster this volume belongs to, read from the volume context.
    pub fn cluster(&self) -> Result<ClusterRef, CsiError> {
        ClusterRef::from_params(&self.volume_context)
    }
}

/// Request to publish (bind-mount) a staged volume into a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// Staging mount point (source of the bind mount).
    pub staging_target_path: String,
    /// Path where the workload container expects the volume.
    pub target_path: String,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
}

// ---------------------------------------------------------------------------
// Capabilities & node info
// ---------------------------------------------------------------------------

/// Node service capabilities advertised to the orchestrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    /// The node implements the stage / unstage sub-protocol.
    StageUnstageVolume,
}

/// Information about the node on which the CSI node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host.
    pub max_volumes: u64,
}

/// Space usage of a published volume.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
}
