//! Node plugin configuration.
//!
//! [`NodeConfig`] can be built from defaults, from YAML, or from environment
//! variables:
//! - `FUSECSI_NODE_ID`: node identifier. Falls back to `NODE_ID`, then to the
//!   kernel hostname.
//! - `FUSECSI_BRIDGE_BINARY`: bridge binary invoked by the pre-stop hook.
//! - `FUSECSI_BRIDGE_FS_NAME`: filesystem name the bridge mount shows in the
//!   mount table.
//! - `FUSECSI_STAGE_LOCK`: `node-wide` (default) or `per-volume`.

use serde::Deserialize;

use crate::error::CsiError;

/// How concurrent stage calls are serialized on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageLockPolicy {
    /// One lock for every stage call on the node.
    #[default]
    NodeWide,
    /// One lock per volume, created on demand.
    PerVolume,
}

impl std::str::FromStr for StageLockPolicy {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node-wide" => Ok(Self::NodeWide),
            "per-volume" => Ok(Self::PerVolume),
            other => Err(CsiError::InvalidArgument(format!(
                "unknown stage lock policy {other:?}"
            ))),
        }
    }
}

/// Configuration for one node plugin instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Identifier of the node this instance runs on; bridge pods are pinned
    /// to it.
    pub node_id: String,
    /// Path of the bridge binary inside the bridge pod image.
    pub bridge_binary: String,
    /// Name the bridge filesystem reports as mount source / fs type.
    pub bridge_fs_name: String,
    /// Suffix appended to the cluster name to find the template config map.
    pub template_config_suffix: String,
    /// Data key in the config map holding the bridge pod template.
    pub template_data_key: String,
    /// Maximum number of volumes reported through `get_info`.
    pub max_volumes: u64,
    /// Stage serialization policy.
    pub stage_lock: StageLockPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            bridge_binary: "/opt/alluxio/integration/fuse/bin/alluxio-fuse".to_owned(),
            bridge_fs_name: "alluxio-fuse".to_owned(),
            template_config_suffix: "-csi-fuse-config".to_owned(),
            template_data_key: "csi-fuse.yaml".to_owned(),
            max_volumes: 256,
            stage_lock: StageLockPolicy::NodeWide,
        }
    }
}

impl NodeConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Result<Self, CsiError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CsiError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        cfg.node_id = match lookup("FUSECSI_NODE_ID").or_else(|| lookup("NODE_ID")) {
            Some(id) => id,
            None => nix::unistd::gethostname()
                .map_err(|e| CsiError::Internal(format!("gethostname: {e}")))?
                .to_string_lossy()
                .into_owned(),
        };
        if let Some(bin) = lookup("FUSECSI_BRIDGE_BINARY") {
            cfg.bridge_binary = bin;
        }
        if let Some(name) = lookup("FUSECSI_BRIDGE_FS_NAME") {
            cfg.bridge_fs_name = name;
        }
        if let Some(policy) = lookup("FUSECSI_STAGE_LOCK") {
            cfg.stage_lock = policy.parse()?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a YAML document into a configuration.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, CsiError> {
        let cfg: Self = serde_yaml::from_str(yaml)
            .map_err(|e| CsiError::InvalidArgument(format!("node config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), CsiError> {
        if self.node_id.is_empty() {
            return Err(CsiError::InvalidArgument("node_id must not be empty".into()));
        }
        if self.bridge_fs_name.is_empty() {
            return Err(CsiError::InvalidArgument(
                "bridge_fs_name must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Name of the config map holding the bridge template for `cluster_name`.
    pub fn template_config_name(&self, cluster_name: &str) -> String {
        format!("{cluster_name}{}", self.template_config_suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn lookup_overrides_defaults() {
        let env = HashMap::from([
            ("FUSECSI_NODE_ID", "n1"),
            ("FUSECSI_BRIDGE_FS_NAME", "remotefs"),
            ("FUSECSI_STAGE_LOCK", "per-volume"),
        ]);
        let cfg = NodeConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.node_id, "n1");
        assert_eq!(cfg.bridge_fs_name, "remotefs");
        assert_eq!(cfg.stage_lock, StageLockPolicy::PerVolume);
        assert_eq!(cfg.template_data_key, "csi-fuse.yaml");
    }

    #[test]
    fn node_id_falls_back_to_legacy_variable() {
        let cfg = NodeConfig::from_lookup(|k| (k == "NODE_ID").then(|| "n7".to_owned())).unwrap();
        assert_eq!(cfg.node_id, "n7");
    }

    #[test]
    fn unknown_lock_policy_rejected() {
        let err = NodeConfig::from_lookup(|k| match k {
            "FUSECSI_NODE_ID" => Some("n1".into()),
            "FUSECSI_STAGE_LOCK" => Some("global".into()),
            _ => None,
        })
        .unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
    }

    #[test]
    fn yaml_config() {
        let cfg = NodeConfig::from_yaml_str(
            "node_id: worker-3\nstage_lock: per-volume\nmax_volumes: 16\n",
        )
        .unwrap();
        assert_eq!(cfg.node_id, "worker-3");
        assert_eq!(cfg.max_volumes, 16);
        assert_eq!(cfg.template_config_name("c1"), "c1-csi-fuse-config");
    }

    #[test]
    fn yaml_requires_node_id() {
        assert!(NodeConfig::from_yaml_str("max_volumes: 4\n").is_err());
        assert!(NodeConfig::from_yaml_str("node_id: a\nbogus: 1\n").is_err());
    }
}
