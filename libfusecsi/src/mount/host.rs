//! [`Mounter`] backed by Linux mount syscalls.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use async_trait::async_trait;
use nix::mount::MsFlags;
use tokio::fs::{self, DirBuilder};
use tracing::debug;

use super::{MountEntry, Mounter, parse_mount_table};

const PROC_MOUNTS: &str = "/proc/self/mounts";

/// Mounts on the host through `mount(2)` / `umount(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMounter;

impl HostMounter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Mounter for HostMounter {
    async fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        if !path.is_absolute() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mount point {} is not absolute", path.display()),
            ));
        }

        // A stale FUSE mount fails right here with ENOTCONN.
        let meta = fs::metadata(path).await?;
        let path = fs::canonicalize(path).await?;
        let Some(parent) = path.parent() else {
            return Ok(true);
        };
        let parent_meta = fs::metadata(parent).await?;
        if meta.dev() != parent_meta.dev() {
            return Ok(true);
        }

        // Same device as the parent: either a plain directory or a bind mount
        // of the same filesystem.  Only the mount table can tell.
        Ok(self
            .mount_entries()
            .await?
            .iter()
            .any(|entry| entry.mount_point == path))
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        DirBuilder::new().recursive(true).mode(0o750).create(path).await
    }

    async fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path).await
    }

    async fn bind_mount(&self, source: &Path, target: &Path) -> io::Result<()> {
        debug!(source = %source.display(), target = %target.display(), "mount --bind");
        nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(io::Error::from)
    }

    async fn remount_read_only(&self, target: &Path) -> io::Result<()> {
        nix::mount::mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(io::Error::from)
    }

    async fn unmount(&self, path: &Path) -> io::Result<()> {
        debug!(path = %path.display(), "umount");
        nix::mount::umount(path).map_err(io::Error::from)
    }

    async fn mount_entries(&self) -> io::Result<Vec<MountEntry>> {
        let contents = fs::read_to_string(PROC_MOUNTS).await?;
        Ok(parse_mount_table(&contents))
    }
}
