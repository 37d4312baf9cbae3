//! Node service backed by per-volume FUSE bridge pods.
//!
//! Stage starts a bridge pod that mounts the remote filesystem at the
//! staging path; publish bind-mounts that path into each container.  The
//! pod name is derived from (cluster, node, volume), so unstage finds the
//! pod again from the volume id alone.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::backend::locks::StageLocks;
use crate::context::NodeContext;
use crate::error::CsiError;
use crate::fusepod;
use crate::mount::{MountPointManager, MountPointState, Mounter};
use crate::node::CsiNode;
use crate::store::StoreError;
use crate::telemetry::TeardownCounters;
use crate::types::{
    ClusterRef, NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest,
    VolumeId,
};

/// CSI node service that delegates the FUSE mount to a bridge pod.
pub struct BridgeNodeServer {
    ctx: NodeContext,
    mounts: MountPointManager,
    stage_locks: StageLocks,
    counters: Arc<TeardownCounters>,
}

impl BridgeNodeServer {
    pub fn new(ctx: NodeContext, mounter: Arc<dyn Mounter>) -> Self {
        let counters = Arc::new(TeardownCounters::new());
        let stage_locks = StageLocks::new(ctx.config.stage_lock);
        info!(
            node_id = %ctx.node_id,
            stage_lock = ?ctx.config.stage_lock,
            "bridge node service initialised",
        );
        Self {
            mounts: MountPointManager::new(mounter, Arc::clone(&counters)),
            stage_locks,
            counters,
            ctx,
        }
    }

    /// Failures swallowed by unpublish / unstage.
    pub fn counters(&self) -> &TeardownCounters {
        &self.counters
    }

    /// Find the cluster owning `volume_id` through its persistent volume and
    /// storage class.  Unstage requests carry no volume context.
    async fn resolve_cluster(&self, volume_id: &VolumeId) -> Result<ClusterRef, CsiError> {
        let pv = self
            .ctx
            .store
            .get_persistent_volume(&volume_id.0)
            .await
            .map_err(CsiError::internal)?;
        let sc = self
            .ctx
            .store
            .get_storage_class(&pv.storage_class_name)
            .await
            .map_err(CsiError::internal)?;
        ClusterRef::from_params(&sc.parameters).map_err(|e| {
            CsiError::internal(StoreError::InvalidObject {
                kind: "storageclass",
                name: sc.name.clone(),
                reason: e.to_string(),
            })
        })
    }

    async fn teardown_bridge(&self, volume_id: &VolumeId, staging: &Path) -> Result<(), CsiError> {
        let cluster = self.resolve_cluster(volume_id).await?;
        let name = fusepod::bridge_pod_name(&cluster.name, &self.ctx.node_id, volume_id);
        fusepod::delete_or_fallback(&self.ctx, &self.mounts, &cluster.namespace, &name, staging)
            .await
    }
}

fn require(value: &str, what: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{what} is required")));
    }
    Ok(())
}

#[async_trait]
impl CsiNode for BridgeNodeServer {
    #[instrument(skip(self), fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        require(&req.volume_id.0, "volume id")?;
        require(&req.staging_target_path, "staging target path")?;

        let _guard = self.stage_locks.acquire(&req.volume_id).await;

        let spec = fusepod::build_spec(&self.ctx, &req).await?;
        fusepod::create_if_absent(&self.ctx, &spec).await?;

        // One probe only; the orchestrator retries stage until the bridge
        // has mounted.
        let staging = Path::new(&req.staging_target_path);
        self.mounts
            .check_mount_healthy(staging, &self.ctx.config.bridge_fs_name)
            .await?;

        info!(
            pod = spec.name(),
            namespace = spec.namespace(),
            path = %req.staging_target_path,
            "volume staged",
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        if let Err(e) = self
            .teardown_bridge(volume_id, Path::new(staging_target_path))
            .await
        {
            self.counters.record_bridge_teardown_failure();
            warn!(
                %volume_id,
                path = staging_target_path,
                error = %e,
                cleanup_failed = true,
                "failed to tear down bridge pod",
            );
            return Ok(());
        }

        info!(%volume_id, path = staging_target_path, "volume unstaged");
        Ok(())
    }

    #[instrument(skip(self), fields(volume_id = %req.volume_id))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        require(&req.volume_id.0, "volume id")?;
        require(&req.staging_target_path, "staging target path")?;
        require(&req.target_path, "target path")?;

        let staging = Path::new(&req.staging_target_path);
        let target = Path::new(&req.target_path);

        if !self.mounts.ensure_publishable(target).await? {
            debug!(target_path = %req.target_path, "target already mounted, assuming idempotent retry");
            return Ok(());
        }

        match self.mounts.inspect(staging).await {
            Ok(MountPointState::Mounted) => {}
            Ok(state) => {
                return Err(CsiError::Internal(format!(
                    "staging path {} is not ready ({state:?}), stage the volume first",
                    req.staging_target_path
                )));
            }
            Err(e) => {
                return Err(CsiError::Internal(format!(
                    "inspect staging path {}: {e}",
                    req.staging_target_path
                )));
            }
        }

        self.mounts
            .bind_mount(staging, target, req.read_only)
            .await?;

        info!(
            target_path = %req.target_path,
            read_only = req.read_only,
            "volume published",
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        self.mounts.cleanup_mount(Path::new(target_path)).await;
        info!(%volume_id, %target_path, "volume unpublished");
        Ok(())
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::StageUnstageVolume])
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.ctx.node_id.clone(),
            max_volumes: self.ctx.config.max_volumes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    use nix::errno::Errno;
    use tracing_test::traced_test;

    use crate::config::{NodeConfig, StageLockPolicy};
    use crate::error::Code;
    use crate::fusepod::template::tests::TEMPLATE;
    use crate::mount::FakeMounter;
    use crate::mount::fake::FakeOp;
    use crate::store::memory::StoreOp;
    use crate::store::{ConfigMap, InMemoryObjectStore, PersistentVolume, StorageClass};
    use crate::types::{CTX_CLUSTER_NAME, CTX_CLUSTER_NAMESPACE};

    const STAGING: &str = "/var/lib/kubelet/plugins/kubernetes.io/csi/pv/pvc-123/globalmount";
    const TARGET: &str = "/var/lib/kubelet/pods/uid/volumes/kubernetes.io~csi/pvc-123/mount";

    struct Harness {
        server: BridgeNodeServer,
        store: Arc<InMemoryObjectStore>,
        fake: Arc<FakeMounter>,
    }

    fn harness_with(policy: StageLockPolicy) -> Harness {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert_config_map(ConfigMap {
            namespace: "storage".into(),
            name: "c1-csi-fuse-config".into(),
            data: BTreeMap::from([("csi-fuse.yaml".to_owned(), TEMPLATE.to_owned())]),
        });
        store.insert_storage_class(StorageClass {
            name: "alluxio".into(),
            parameters: HashMap::from([
                (CTX_CLUSTER_NAME.to_owned(), "c1".to_owned()),
                (CTX_CLUSTER_NAMESPACE.to_owned(), "storage".to_owned()),
            ]),
        });
        store.insert_persistent_volume(PersistentVolume {
            name: "pvc-123".into(),
            storage_class_name: "alluxio".into(),
        });

        let config = NodeConfig {
            node_id: "n1".into(),
            stage_lock: policy,
            ..Default::default()
        };
        let fake = Arc::new(FakeMounter::new());
        let server = BridgeNodeServer::new(NodeContext::new(config, store.clone()), fake.clone());
        Harness { server, store, fake }
    }

    fn harness() -> Harness {
        harness_with(StageLockPolicy::NodeWide)
    }

    fn stage_request() -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_id: "pvc-123".into(),
            staging_target_path: STAGING.into(),
            volume_context: HashMap::from([
                (CTX_CLUSTER_NAME.to_owned(), "c1".to_owned()),
                (CTX_CLUSTER_NAMESPACE.to_owned(), "storage".to_owned()),
            ]),
        }
    }

    fn publish_request(read_only: bool) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: "pvc-123".into(),
            staging_target_path: STAGING.into(),
            target_path: TARGET.into(),
            read_only,
        }
    }

    // -----------------------------------------------------------------------
    // stage
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn stage_twice_creates_one_pod() {
        let h = harness();
        h.fake.mount_bridge(STAGING, "alluxio-fuse");

        h.server.stage_volume(stage_request()).await.unwrap();
        h.server.stage_volume(stage_request()).await.unwrap();

        assert_eq!(h.store.pod_count(), 1);
        let pod = h.store.pod("storage", "c1-n1-123").unwrap();
        assert_eq!(pod.spec.node_name.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn stage_before_bridge_mounts_fails_then_retry_succeeds() {
        let h = harness();

        let err = h.server.stage_volume(stage_request()).await.unwrap_err();
        assert!(matches!(err, CsiError::MountNotReady { .. }));
        assert_eq!(err.code(), Code::Internal);
        // The pod stays; the retry must not create a second one.
        assert_eq!(h.store.pod_count(), 1);

        h.fake.mount_bridge(STAGING, "alluxio-fuse");
        h.server.stage_volume(stage_request()).await.unwrap();
        assert_eq!(h.store.pod_count(), 1);
    }

    #[tokio::test]
    async fn stage_rejects_foreign_mount_at_staging_path() {
        let h = harness();
        h.fake.mount_bridge(STAGING, "other-fs");

        let err = h.server.stage_volume(stage_request()).await.unwrap_err();
        assert!(matches!(err, CsiError::MountNotReady { ref reason, .. } if reason.contains("alluxio-fuse")));
    }

    #[tokio::test]
    async fn stage_on_dead_bridge_mount_is_not_ready() {
        let h = harness();
        h.fake.mount_bridge(STAGING, "alluxio-fuse");
        h.fake.corrupt(STAGING);

        let err = h.server.stage_volume(stage_request()).await.unwrap_err();
        assert!(matches!(err, CsiError::MountNotReady { .. }));
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn stage_without_cluster_context_is_invalid_argument() {
        let h = harness();
        let mut req = stage_request();
        req.volume_context.remove(CTX_CLUSTER_NAMESPACE);

        let err = h.server.stage_volume(req).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(h.store.pod_count(), 0);
    }

    #[tokio::test]
    async fn stage_without_staging_path_is_invalid_argument() {
        let h = harness();
        let mut req = stage_request();
        req.staging_target_path.clear();

        let err = h.server.stage_volume(req).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn stage_surfaces_pod_creation_failure() {
        let h = harness();
        h.store
            .inject_error(StoreOp::CreatePod, StoreError::Backend("quota exceeded".into()));

        let err = h.server.stage_volume(stage_request()).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn concurrent_stages_of_one_volume_create_one_pod() {
        let h = Arc::new(harness_with(StageLockPolicy::PerVolume));
        h.fake.mount_bridge(STAGING, "alluxio-fuse");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let h = Arc::clone(&h);
                tokio::spawn(async move { h.server.stage_volume(stage_request()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(h.store.pod_count(), 1);
        assert_eq!(h.server.stage_locks.tracked_volumes(), 0);
    }

    // -----------------------------------------------------------------------
    // publish
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn publish_is_idempotent() {
        let h = harness();
        h.fake.mount_bridge(STAGING, "alluxio-fuse");

        h.server.publish_volume(publish_request(false)).await.unwrap();
        h.server.publish_volume(publish_request(false)).await.unwrap();

        assert_eq!(h.fake.bind_calls(), 1);
        assert_eq!(h.fake.mount_source(TARGET).as_deref(), Some("alluxio-fuse"));
    }

    #[tokio::test]
    async fn publish_read_only_remounts() {
        let h = harness();
        h.fake.mount_bridge(STAGING, "alluxio-fuse");

        h.server.publish_volume(publish_request(true)).await.unwrap();
        assert_eq!(h.fake.mount_options(TARGET).as_deref(), Some("ro"));
    }

    #[tokio::test]
    async fn publish_without_staged_mount_is_internal() {
        let h = harness();
        h.fake.add_dir(STAGING);

        let err = h.server.publish_volume(publish_request(false)).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert_eq!(h.fake.bind_calls(), 0);
    }

    #[tokio::test]
    async fn publish_permission_denied_is_classified() {
        let h = harness();
        h.fake.mount_bridge(STAGING, "alluxio-fuse");
        h.fake.inject_failure(FakeOp::Bind, Errno::EPERM);

        let err = h.server.publish_volume(publish_request(false)).await.unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
    }

    #[tokio::test]
    async fn publish_recovers_corrupted_target() {
        let h = harness();
        h.fake.mount_bridge(STAGING, "alluxio-fuse");
        h.fake.mount_bridge(TARGET, "alluxio-fuse");
        h.fake.corrupt(TARGET);

        h.server.publish_volume(publish_request(false)).await.unwrap();
        assert!(h.fake.is_mounted(TARGET));
        assert_eq!(h.fake.unmount_calls(), 1);
        assert_eq!(h.fake.bind_calls(), 1);
    }

    #[tokio::test]
    async fn publish_without_target_is_invalid_argument() {
        let h = harness();
        let mut req = publish_request(false);
        req.target_path.clear();

        let err = h.server.publish_volume(req).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    // -----------------------------------------------------------------------
    // unpublish
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unpublish_unmounts_and_removes_target() {
        let h = harness();
        h.fake.mount_bridge(STAGING, "alluxio-fuse");
        h.server.publish_volume(publish_request(false)).await.unwrap();

        h.server
            .unpublish_volume(&"pvc-123".into(), TARGET)
            .await
            .unwrap();
        assert!(!h.fake.is_mounted(TARGET));
        assert!(!h.fake.has_dir(TARGET));
        assert_eq!(h.server.counters().mount_cleanup_failures(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn unpublish_failure_is_ok_but_observable() {
        let h = harness();
        h.fake.mount_bridge(STAGING, "alluxio-fuse");
        h.server.publish_volume(publish_request(false)).await.unwrap();
        h.fake.inject_failure(FakeOp::Unmount, Errno::EBUSY);

        h.server
            .unpublish_volume(&"pvc-123".into(), TARGET)
            .await
            .unwrap();
        assert_eq!(h.server.counters().mount_cleanup_failures(), 1);
        assert!(logs_contain("cleanup_failed=true"));
    }

    #[tokio::test]
    async fn unpublish_of_absent_target_is_ok() {
        let h = harness();
        h.server
            .unpublish_volume(&"pvc-123".into(), TARGET)
            .await
            .unwrap();
        assert_eq!(h.fake.unmount_calls(), 0);
    }

    // -----------------------------------------------------------------------
    // unstage
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unstage_deletes_pod_then_falls_back_to_unmount() {
        let h = harness();
        h.fake.mount_bridge(STAGING, "alluxio-fuse");
        h.server.stage_volume(stage_request()).await.unwrap();

        h.server
            .unstage_volume(&"pvc-123".into(), STAGING)
            .await
            .unwrap();
        assert_eq!(h.store.pod_count(), 0);
        // The pre-stop hook owns the unmount while the pod exists.
        assert_eq!(h.fake.unmount_calls(), 0);

        h.server
            .unstage_volume(&"pvc-123".into(), STAGING)
            .await
            .unwrap();
        assert!(!h.fake.is_mounted(STAGING));
        assert_eq!(h.server.counters().bridge_teardown_failures(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn unstage_of_unknown_volume_is_ok_but_counted() {
        let h = harness();
        h.server
            .unstage_volume(&"pvc-missing".into(), STAGING)
            .await
            .unwrap();
        assert_eq!(h.server.counters().bridge_teardown_failures(), 1);
        assert!(logs_contain("failed to tear down bridge pod"));
    }

    #[tokio::test]
    async fn unstage_delete_failure_is_ok_but_counted() {
        let h = harness();
        h.fake.mount_bridge(STAGING, "alluxio-fuse");
        h.server.stage_volume(stage_request()).await.unwrap();
        h.store
            .inject_error(StoreOp::DeletePod, StoreError::Backend("timeout".into()));

        h.server
            .unstage_volume(&"pvc-123".into(), STAGING)
            .await
            .unwrap();
        assert_eq!(h.store.pod_count(), 1);
        assert_eq!(h.server.counters().bridge_teardown_failures(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn unstage_with_incomplete_storage_class_is_ok_but_counted() {
        let h = harness();
        h.store.insert_storage_class(StorageClass {
            name: "alluxio".into(),
            parameters: HashMap::new(),
        });

        h.server
            .unstage_volume(&"pvc-123".into(), STAGING)
            .await
            .unwrap();
        assert_eq!(h.server.counters().bridge_teardown_failures(), 1);
        assert!(logs_contain("storageclass alluxio is invalid"));
    }

    // -----------------------------------------------------------------------
    // misc
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn capabilities_are_stage_unstage_only() {
        let h = harness();
        assert_eq!(
            h.server.get_capabilities().await.unwrap(),
            vec![NodeCapability::StageUnstageVolume]
        );
    }

    #[tokio::test]
    async fn expand_and_stats_are_unimplemented() {
        let h = harness();
        let err = h
            .server
            .expand_volume(&"pvc-123".into(), TARGET)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);

        let err = h
            .server
            .get_volume_stats(&"pvc-123".into(), TARGET)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn info_reports_configured_node() {
        let h = harness();
        let info = h.server.get_info().await.unwrap();
        assert_eq!(info.node_id, "n1");
        assert_eq!(info.max_volumes, 256);
    }
}
