//! In-memory [`Mounter`].
//!
//! Keeps a directory set and a mount table in concurrent maps and mimics the
//! errno behavior of the Linux calls the host mounter uses.  Failures can be
//! injected per operation.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use nix::errno::Errno;

use super::{MountEntry, Mounter};

/// Operations of [`FakeMounter`] that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    IsMountPoint,
    CreateDir,
    RemoveDir,
    Bind,
    Remount,
    Unmount,
    MountTable,
}

/// A mount table that lives in memory.
#[derive(Debug, Default)]
pub struct FakeMounter {
    dirs: DashSet<PathBuf>,
    mounts: DashMap<PathBuf, MountEntry>,
    corrupted: DashSet<PathBuf>,
    failures: DashMap<FakeOp, Errno>,
    bind_calls: AtomicUsize,
    unmount_calls: AtomicUsize,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `op` fail with `errno` until cleared.
    pub fn inject_failure(&self, op: FakeOp, errno: Errno) {
        self.failures.insert(op, errno);
    }

    pub fn clear_failure(&self, op: FakeOp) {
        self.failures.remove(&op);
    }

    /// Create a plain directory.
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        self.dirs.insert(path.as_ref().to_path_buf());
    }

    /// Simulate a bridge process mounting its filesystem at `path`.
    pub fn mount_bridge(&self, path: impl AsRef<Path>, fs_name: &str) {
        let path = path.as_ref().to_path_buf();
        self.dirs.insert(path.clone());
        self.corrupted.remove(&path);
        self.mounts.insert(
            path.clone(),
            MountEntry {
                source: fs_name.to_owned(),
                mount_point: path,
                fs_type: format!("fuse.{fs_name}"),
                options: "rw,nosuid,nodev".to_owned(),
            },
        );
    }

    /// Simulate the process behind the mount at `path` dying.
    pub fn corrupt(&self, path: impl AsRef<Path>) {
        self.corrupted.insert(path.as_ref().to_path_buf());
    }

    pub fn has_dir(&self, path: impl AsRef<Path>) -> bool {
        self.dirs.contains(path.as_ref())
    }

    pub fn is_mounted(&self, path: impl AsRef<Path>) -> bool {
        self.mounts.contains_key(path.as_ref())
    }

    pub fn mount_options(&self, path: impl AsRef<Path>) -> Option<String> {
        self.mounts.get(path.as_ref()).map(|e| e.options.clone())
    }

    pub fn mount_source(&self, path: impl AsRef<Path>) -> Option<String> {
        self.mounts.get(path.as_ref()).map(|e| e.source.clone())
    }

    /// Number of bind mount attempts, failed ones included.
    pub fn bind_calls(&self) -> usize {
        self.bind_calls.load(Ordering::SeqCst)
    }

    /// Number of unmount attempts, failed ones included.
    pub fn unmount_calls(&self) -> usize {
        self.unmount_calls.load(Ordering::SeqCst)
    }

    fn check(&self, op: FakeOp) -> io::Result<()> {
        match self.failures.get(&op) {
            Some(errno) => Err(io::Error::from(*errno)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        self.check(FakeOp::IsMountPoint)?;
        if self.corrupted.contains(path) {
            return Err(io::Error::from(Errno::ENOTCONN));
        }
        if self.mounts.contains_key(path) {
            return Ok(true);
        }
        if self.dirs.contains(path) {
            return Ok(false);
        }
        Err(io::Error::from(Errno::ENOENT))
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.check(FakeOp::CreateDir)?;
        self.dirs.insert(path.to_path_buf());
        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> io::Result<()> {
        self.check(FakeOp::RemoveDir)?;
        if self.mounts.contains_key(path) {
            return Err(io::Error::from(Errno::EBUSY));
        }
        match self.dirs.remove(path) {
            Some(_) => Ok(()),
            None => Err(io::Error::from(Errno::ENOENT)),
        }
    }

    async fn bind_mount(&self, source: &Path, target: &Path) -> io::Result<()> {
        self.bind_calls.fetch_add(1, Ordering::SeqCst);
        self.check(FakeOp::Bind)?;
        if !self.dirs.contains(target) {
            return Err(io::Error::from(Errno::ENOENT));
        }
        if self.mounts.contains_key(target) {
            return Err(io::Error::from(Errno::EBUSY));
        }

        // A bind of a mounted tree shows the original source and fs type.
        let (src, fs_type) = match self.mounts.get(source) {
            Some(entry) => (entry.source.clone(), entry.fs_type.clone()),
            None => (source.display().to_string(), "none".to_owned()),
        };
        self.mounts.insert(
            target.to_path_buf(),
            MountEntry {
                source: src,
                mount_point: target.to_path_buf(),
                fs_type,
                options: "rw".to_owned(),
            },
        );
        Ok(())
    }

    async fn remount_read_only(&self, target: &Path) -> io::Result<()> {
        self.check(FakeOp::Remount)?;
        match self.mounts.get_mut(target) {
            Some(mut entry) => {
                entry.options = "ro".to_owned();
                Ok(())
            }
            None => Err(io::Error::from(Errno::EINVAL)),
        }
    }

    async fn unmount(&self, path: &Path) -> io::Result<()> {
        self.unmount_calls.fetch_add(1, Ordering::SeqCst);
        self.check(FakeOp::Unmount)?;
        self.corrupted.remove(path);
        match self.mounts.remove(path) {
            Some(_) => Ok(()),
            None => Err(io::Error::from(Errno::EINVAL)),
        }
    }

    async fn mount_entries(&self) -> io::Result<Vec<MountEntry>> {
        self.check(FakeOp::MountTable)?;
        Ok(self.mounts.iter().map(|e| e.value().clone()).collect())
    }
}
