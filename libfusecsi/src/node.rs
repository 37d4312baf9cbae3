//! CSI Node service trait.
//!
//! The Node service runs on each worker node and handles the local work
//! required to make a volume available to Pod containers:
//!
//! 1. **Stage**: start the bridge pod that FUSE-mounts the remote
//!    filesystem at a node-global staging path.
//! 2. **Publish**: bind-mount the staging path into the Pod's container.
//! 3. **Unpublish**: remove the bind-mount.
//! 4. **Unstage**: retire the bridge pod, which unmounts the staging path.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId,
    VolumeUsage,
};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume.
    ///
    /// Idempotent: staging an already-staged volume succeeds without
    /// creating anything new.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume.
    ///
    /// Never fails towards the caller; teardown problems are logged.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume.
    ///
    /// Idempotent: a target that is already mounted is left alone.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume.
    ///
    /// Never fails towards the caller; teardown problems are logged.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Grow a volume on the node.  Returns the new capacity in bytes.
    async fn expand_volume(
        &self,
        volume_id: &VolumeId,
        _volume_path: &str,
    ) -> Result<u64, CsiError> {
        Err(CsiError::Unimplemented(format!(
            "node expansion of volume {volume_id}"
        )))
    }

    /// Report space usage of a published volume.
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        _volume_path: &str,
    ) -> Result<VolumeUsage, CsiError> {
        Err(CsiError::Unimplemented(format!(
            "volume stats for {volume_id}"
        )))
    }

    /// Capabilities of this node service.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
