//! Cluster object store access.
//!
//! The node service reads three kinds of objects (config maps, persistent
//! volumes, storage classes) and creates / deletes bridge pods.  [`ObjectStore`]
//! is the seam to the orchestrator's API; [`memory::InMemoryObjectStore`] is
//! a complete in-process implementation.

pub mod memory;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use thiserror::Error;

use crate::fusepod::template::Pod;

pub use memory::InMemoryObjectStore;

/// Errors returned by an [`ObjectStore`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The named object does not exist.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// An object with this name already exists.
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// The object exists but is malformed.
    #[error("{kind} {name} is invalid: {reason}")]
    InvalidObject {
        kind: &'static str,
        name: String,
        reason: String,
    },

    /// Anything else the store reports (connectivity, authorization, ...).
    #[error("object store error: {0}")]
    Backend(String),
}

/// A namespaced key/value configuration object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigMap {
    pub namespace: String,
    pub name: String,
    pub data: BTreeMap<String, String>,
}

/// The part of a persistent volume the node service needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentVolume {
    /// Volume name; equal to the CSI volume id.
    pub name: String,
    pub storage_class_name: String,
}

/// The part of a storage class the node service needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageClass {
    pub name: String,
    pub parameters: HashMap<String, String>,
}

/// Orchestrator object store used by the node service.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, StoreError>;

    /// Create `pod` in its own namespace.
    ///
    /// Fails with [`StoreError::AlreadyExists`] if the name is taken.
    async fn create_pod(&self, pod: &Pod) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] if no such pod exists.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn get_persistent_volume(&self, name: &str) -> Result<PersistentVolume, StoreError>;

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass, StoreError>;
}
