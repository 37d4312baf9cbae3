//! Bridge pod lifecycle.
//!
//! A bridge pod runs the FUSE client that mounts the remote filesystem at a
//! volume's staging path.  There is at most one per (cluster, node, volume):
//! its name is a pure function of that triple ([`bridge_pod_name`]) and
//! creating a name that already exists is treated as success, so stage can
//! be retried freely and unstage can find the pod again without state.

pub mod template;

use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::context::NodeContext;
use crate::error::CsiError;
use crate::mount::MountPointManager;
use crate::store::StoreError;
use crate::types::{ClusterRef, NodeStageVolumeRequest, VolumeId};

use template::{ExecAction, LifecycleHandler, MOUNT_POINT_ARG, Pod, parse_pod_template};

/// Longest bridge pod name this crate generates.
pub const MAX_POD_NAME_LEN: usize = 64;

/// Hex digits of the disambiguating hash appended to truncated names.
const NAME_HASH_LEN: usize = 10;

/// A bridge pod ready to be submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgePodSpec {
    pub cluster: ClusterRef,
    pub pod: Pod,
}

impl BridgePodSpec {
    pub fn name(&self) -> &str {
        &self.pod.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.pod.metadata.namespace
    }
}

/// Deterministic bridge pod name: `{cluster}-{node}-{last segment of volume id}`.
///
/// Names longer than [`MAX_POD_NAME_LEN`] are cut and suffixed with a hash of
/// the full (cluster, node, volume id) triple, so volumes that only differ
/// past the cut still get distinct pods.
pub fn bridge_pod_name(cluster_name: &str, node_id: &str, volume_id: &VolumeId) -> String {
    let name = format!("{cluster_name}-{node_id}-{}", volume_id.last_segment());
    if name.len() <= MAX_POD_NAME_LEN {
        return name;
    }

    let digest = Sha256::new()
        .chain_update(cluster_name)
        .chain_update([0u8])
        .chain_update(node_id)
        .chain_update([0u8])
        .chain_update(&volume_id.0)
        .finalize();
    let hash = hex::encode(digest);

    let mut cut = MAX_POD_NAME_LEN - NAME_HASH_LEN - 1;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    let prefix = name[..cut].trim_end_matches('-');
    format!("{prefix}-{}", &hash[..NAME_HASH_LEN])
}

/// Fetch the cluster's bridge template and complete it for this node and
/// volume.
pub async fn build_spec(
    ctx: &NodeContext,
    req: &NodeStageVolumeRequest,
) -> Result<BridgePodSpec, CsiError> {
    let cluster = req.cluster()?;
    let template = fetch_template(ctx, &cluster).await?;
    complete_spec(ctx, cluster, req, template)
}

async fn fetch_template(ctx: &NodeContext, cluster: &ClusterRef) -> Result<Pod, CsiError> {
    let cm_name = ctx.config.template_config_name(&cluster.name);
    let source_name = format!("{}/{cm_name}", cluster.namespace);

    let cm = ctx
        .store
        .get_config_map(&cluster.namespace, &cm_name)
        .await
        .map_err(|e| {
            CsiError::Internal(format!(
                "failed to find the config map holding the bridge pod template: {e}"
            ))
        })?;

    let yaml = cm
        .data
        .get(&ctx.config.template_data_key)
        .ok_or_else(|| CsiError::InvalidTemplate {
            source_name: source_name.clone(),
            reason: format!("missing data key {}", ctx.config.template_data_key),
        })?;

    parse_pod_template(&source_name, yaml)
}

fn complete_spec(
    ctx: &NodeContext,
    cluster: ClusterRef,
    req: &NodeStageVolumeRequest,
    mut pod: Pod,
) -> Result<BridgePodSpec, CsiError> {
    pod.metadata.name = bridge_pod_name(&cluster.name, &ctx.node_id, &req.volume_id);
    pod.metadata.namespace = cluster.namespace.clone();
    pod.spec.node_name = Some(ctx.node_id.clone());

    let container = pod
        .spec
        .containers
        .first_mut()
        .ok_or_else(|| CsiError::InvalidTemplate {
            source_name: cluster.to_string(),
            reason: "pod has no containers".into(),
        })?;
    let mount_arg =
        container
            .args
            .get_mut(MOUNT_POINT_ARG)
            .ok_or_else(|| CsiError::InvalidTemplate {
                source_name: cluster.to_string(),
                reason: format!("no mount point argument at index {MOUNT_POINT_ARG}"),
            })?;
    *mount_arg = req.staging_target_path.clone();

    container.lifecycle.get_or_insert_with(Default::default).pre_stop = Some(LifecycleHandler {
        exec: Some(ExecAction {
            command: vec![
                ctx.config.bridge_binary.clone(),
                "unmount".to_owned(),
                req.staging_target_path.clone(),
            ],
        }),
    });

    Ok(BridgePodSpec { cluster, pod })
}

/// Submit `spec`; an existing pod of the same name counts as success.
pub async fn create_if_absent(ctx: &NodeContext, spec: &BridgePodSpec) -> Result<(), CsiError> {
    match ctx.store.create_pod(&spec.pod).await {
        Ok(()) => {
            info!(pod = spec.name(), namespace = spec.namespace(), "bridge pod created");
            Ok(())
        }
        Err(StoreError::AlreadyExists { .. }) => {
            debug!(pod = spec.name(), "bridge pod already exists, skip creating");
            Ok(())
        }
        Err(e) => Err(CsiError::Internal(format!(
            "create bridge pod {}/{}: {e}",
            spec.namespace(),
            spec.name()
        ))),
    }
}

/// Delete the bridge pod `namespace/name`.
///
/// If the pod is already gone nobody will run its pre-stop unmount, so the
/// staging path is unmounted here instead.  The outcome of that unmount is
/// logged, not returned.
pub async fn delete_or_fallback(
    ctx: &NodeContext,
    mounts: &MountPointManager,
    namespace: &str,
    name: &str,
    staging_path: &Path,
) -> Result<(), CsiError> {
    match ctx.store.delete_pod(namespace, name).await {
        Ok(()) => {
            info!(pod = name, namespace, "bridge pod deleted");
            Ok(())
        }
        Err(StoreError::NotFound { .. }) => {
            warn!(
                pod = name,
                namespace,
                staging = %staging_path.display(),
                "bridge pod not found, unmounting staging path directly",
            );
            mounts.unmount_best_effort(staging_path).await;
            Ok(())
        }
        Err(e) => Err(CsiError::Internal(format!(
            "delete bridge pod {namespace}/{name}: {e}"
        ))),
    }
}
