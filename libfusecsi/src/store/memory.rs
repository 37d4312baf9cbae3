//! In-process [`ObjectStore`].
//!
//! All state lives in concurrent maps so the store can be shared between
//! tasks.  Errors can be injected per operation to exercise the failure
//! paths of the node service.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{ConfigMap, ObjectStore, PersistentVolume, StorageClass, StoreError};
use crate::fusepod::template::Pod;

type NamespacedKey = (String, String);

fn key(namespace: &str, name: &str) -> NamespacedKey {
    (namespace.to_owned(), name.to_owned())
}

/// Operations of [`InMemoryObjectStore`] that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetConfigMap,
    CreatePod,
    DeletePod,
    GetPersistentVolume,
    GetStorageClass,
}

/// Object store held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    config_maps: DashMap<NamespacedKey, ConfigMap>,
    pods: DashMap<NamespacedKey, Pod>,
    persistent_volumes: DashMap<String, PersistentVolume>,
    storage_classes: DashMap<String, StorageClass>,
    failures: DashMap<StoreOp, StoreError>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_config_map(&self, cm: ConfigMap) {
        self.config_maps
            .insert(key(&cm.namespace, &cm.name), cm);
    }

    pub fn insert_persistent_volume(&self, pv: PersistentVolume) {
        self.persistent_volumes.insert(pv.name.clone(), pv);
    }

    pub fn insert_storage_class(&self, sc: StorageClass) {
        self.storage_classes.insert(sc.name.clone(), sc);
    }

    /// Make every subsequent `op` fail with `err` until cleared.
    pub fn inject_error(&self, op: StoreOp, err: StoreError) {
        self.failures.insert(op, err);
    }

    pub fn clear_error(&self, op: StoreOp) {
        self.failures.remove(&op);
    }

    /// Look up a pod by namespace and name.
    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods.get(&key(namespace, name)).map(|p| p.clone())
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    fn check(&self, op: StoreOp) -> Result<(), StoreError> {
        match self.failures.get(&op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, StoreError> {
        self.check(StoreOp::GetConfigMap)?;
        self.config_maps
            .get(&key(namespace, name))
            .map(|cm| cm.clone())
            .ok_or_else(|| StoreError::NotFound {
                kind: "configmap",
                name: format!("{namespace}/{name}"),
            })
    }

    async fn create_pod(&self, pod: &Pod) -> Result<(), StoreError> {
        self.check(StoreOp::CreatePod)?;
        match self
            .pods
            .entry(key(&pod.metadata.namespace, &pod.metadata.name))
        {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists {
                kind: "pod",
                name: format!("{}/{}", pod.metadata.namespace, pod.metadata.name),
            }),
            Entry::Vacant(slot) => {
                slot.insert(pod.clone());
                Ok(())
            }
        }
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.check(StoreOp::DeletePod)?;
        self.pods
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                kind: "pod",
                name: format!("{namespace}/{name}"),
            })
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<PersistentVolume, StoreError> {
        self.check(StoreOp::GetPersistentVolume)?;
        self.persistent_volumes
            .get(name)
            .map(|pv| pv.clone())
            .ok_or_else(|| StoreError::NotFound {
                kind: "persistentvolume",
                name: name.to_owned(),
            })
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass, StoreError> {
        self.check(StoreOp::GetStorageClass)?;
        self.storage_classes
            .get(name)
            .map(|sc| sc.clone())
            .ok_or_else(|| StoreError::NotFound {
                kind: "storageclass",
                name: name.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusepod::template::ObjectMeta;

    fn pod(namespace: &str, name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_pod_twice_reports_already_exists() {
        let store = InMemoryObjectStore::new();
        store.create_pod(&pod("ns", "p")).await.unwrap();
        let err = store.create_pod(&pod("ns", "p")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        assert_eq!(store.pod_count(), 1);

        // Same name in another namespace is a different object.
        store.create_pod(&pod("other", "p")).await.unwrap();
        assert_eq!(store.pod_count(), 2);
    }

    #[tokio::test]
    async fn delete_missing_pod_reports_not_found() {
        let store = InMemoryObjectStore::new();
        store.create_pod(&pod("ns", "p")).await.unwrap();
        store.delete_pod("ns", "p").await.unwrap();
        let err = store.delete_pod("ns", "p").await.unwrap_err();
        assert_eq!(
            err,
            StoreError::NotFound {
                kind: "pod",
                name: "ns/p".into()
            }
        );
    }

    #[tokio::test]
    async fn injected_errors_apply_until_cleared() {
        let store = InMemoryObjectStore::new();
        store.inject_error(StoreOp::CreatePod, StoreError::Backend("etcd timeout".into()));
        assert!(matches!(
            store.create_pod(&pod("ns", "p")).await,
            Err(StoreError::Backend(_))
        ));
        store.clear_error(StoreOp::CreatePod);
        store.create_pod(&pod("ns", "p")).await.unwrap();
    }

    #[tokio::test]
    async fn lookups() {
        let store = InMemoryObjectStore::new();
        store.insert_persistent_volume(PersistentVolume {
            name: "pvc-1".into(),
            storage_class_name: "fast".into(),
        });
        assert_eq!(
            store.get_persistent_volume("pvc-1").await.unwrap().storage_class_name,
            "fast"
        );
        assert!(store.get_storage_class("fast").await.is_err());
        assert!(store.get_config_map("ns", "cm").await.is_err());
    }
}
