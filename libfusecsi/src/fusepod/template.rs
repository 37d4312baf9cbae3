//! Typed bridge pod schema and strict template decoding.
//!
//! Only the fields the node service reads or writes are modelled.  Everything
//! else in the template (volumes, security context, resources, ...) is kept
//! verbatim in the `extra` maps so the submitted pod matches what the cluster
//! operator wrote.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::CsiError;

/// The only resource kind a template may describe.
pub const POD_KIND: &str = "Pod";

/// API version the template must declare.
pub const POD_API_VERSION: &str = "v1";

/// Index of the mount point in the first container's `args`.
pub const MOUNT_POINT_ARG: usize = 2;

type Extra = BTreeMap<String, Value>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeMeta {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Node the pod is pinned to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_stop: Option<LifecycleHandler>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifecycleHandler {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecAction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecAction {
    pub command: Vec<String>,
}

/// Decode a bridge pod template.
///
/// The `apiVersion`/`kind` header is checked before the body is decoded, so
/// a template for any other resource is rejected without interpreting its
/// fields.  `source_name` names the config map in error messages.
pub fn parse_pod_template(source_name: &str, yaml: &str) -> Result<Pod, CsiError> {
    let invalid = |reason: String| CsiError::InvalidTemplate {
        source_name: source_name.to_owned(),
        reason,
    };

    let header: TypeMeta =
        serde_yaml::from_str(yaml).map_err(|e| invalid(format!("decode header: {e}")))?;
    if header.kind != POD_KIND {
        return Err(invalid(format!(
            "only kind {POD_KIND} is supported, found {:?}",
            header.kind
        )));
    }
    if header.api_version != POD_API_VERSION {
        return Err(invalid(format!(
            "expected apiVersion {POD_API_VERSION}, found {:?}",
            header.api_version
        )));
    }

    let pod: Pod = serde_yaml::from_str(yaml).map_err(|e| invalid(format!("decode pod: {e}")))?;

    let Some(container) = pod.spec.containers.first() else {
        return Err(invalid("pod has no containers".into()));
    };
    if container.args.len() <= MOUNT_POINT_ARG {
        return Err(invalid(format!(
            "container {} needs a mount point argument at index {MOUNT_POINT_ARG}, has {} args",
            container.name,
            container.args.len()
        )));
    }
    Ok(pod)
}
