//! Serialization of stage calls.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};

use crate::config::StageLockPolicy;
use crate::types::VolumeId;

/// Locks taken by stage calls.
///
/// With [`StageLockPolicy::NodeWide`] every stage on the node is serialized.
/// With [`StageLockPolicy::PerVolume`] only stages of the same volume are;
/// the per-volume mutexes are created on first use and dropped once nobody
/// holds or waits for them.
#[derive(Debug)]
pub struct StageLocks {
    policy: StageLockPolicy,
    node: Mutex<()>,
    volumes: DashMap<VolumeId, Arc<Mutex<()>>>,
}

/// Held for the duration of one stage call.
#[must_use]
pub struct StageGuard<'a> {
    _node: Option<MutexGuard<'a, ()>>,
    _volume: Option<VolumeGuard<'a>>,
}

struct VolumeGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    volumes: &'a DashMap<VolumeId, Arc<Mutex<()>>>,
    volume_id: VolumeId,
}

impl Drop for VolumeGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // The map holds one reference; any other is a holder or a waiter.
        self.volumes
            .remove_if(&self.volume_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl StageLocks {
    pub fn new(policy: StageLockPolicy) -> Self {
        Self {
            policy,
            node: Mutex::new(()),
            volumes: DashMap::new(),
        }
    }

    /// Wait until this caller may stage `volume_id`.
    pub async fn acquire(&self, volume_id: &VolumeId) -> StageGuard<'_> {
        match self.policy {
            StageLockPolicy::NodeWide => StageGuard {
                _node: Some(self.node.lock().await),
                _volume: None,
            },
            StageLockPolicy::PerVolume => {
                let lock = self.volumes.entry(volume_id.clone()).or_default().clone();
                let guard = lock.lock_owned().await;
                StageGuard {
                    _node: None,
                    _volume: Some(VolumeGuard {
                        guard: Some(guard),
                        volumes: &self.volumes,
                        volume_id: volume_id.clone(),
                    }),
                }
            }
        }
    }

    /// Number of volumes that currently have a lock entry.
    pub fn tracked_volumes(&self) -> usize {
        self.volumes.len()
    }
}
