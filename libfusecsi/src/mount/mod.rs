//! Mount point inspection and repair.
//!
//! [`MountPointManager`] decides what a lifecycle call has to do with an OS
//! mount point and does it through a [`Mounter`].  The OS mount table is the
//! only source of truth: nothing here caches mount state, every decision
//! re-inspects the path.
//!
//! Two [`Mounter`]s ship with the crate:
//!
//! | Type | Use |
//! |---|---|
//! | [`host::HostMounter`] | Linux syscalls via `nix`, `/proc/self/mounts`. |
//! | [`fake::FakeMounter`] | In-memory mount table for tests and dry runs. |

pub mod fake;
pub mod host;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use nix::errno::Errno;
use tracing::{debug, info, warn};

use crate::error::CsiError;
use crate::telemetry::TeardownCounters;

pub use fake::FakeMounter;
pub use host::HostMounter;

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mount source (device or FUSE filesystem name).
    pub source: String,
    /// Where the filesystem is mounted.
    pub mount_point: PathBuf,
    /// Filesystem type, e.g. `fuse.alluxio-fuse`.
    pub fs_type: String,
    /// Comma separated mount options.
    pub options: String,
}

/// OS mount subsystem operations needed by the node service.
///
/// Errors are plain [`io::Error`]s carrying the raw OS error where there is
/// one, so callers can classify them.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// `Ok(true)` if `path` is a mount point, `Ok(false)` if it is an
    /// ordinary directory.  A missing path is an error of kind
    /// [`io::ErrorKind::NotFound`].
    async fn is_mount_point(&self, path: &Path) -> io::Result<bool>;

    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    async fn remove_dir(&self, path: &Path) -> io::Result<()>;

    /// Bind `source` onto `target`.  `target` must exist and not be mounted.
    async fn bind_mount(&self, source: &Path, target: &Path) -> io::Result<()>;

    /// Remount an existing bind mount read-only.
    async fn remount_read_only(&self, target: &Path) -> io::Result<()>;

    async fn unmount(&self, path: &Path) -> io::Result<()>;

    /// Current mount table.
    async fn mount_entries(&self) -> io::Result<Vec<MountEntry>>;
}

/// Inferred state of a path with respect to the mount table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountPointState {
    /// Nothing exists at the path.
    Absent,
    /// The path is a working mount point.
    Mounted,
    /// The path is a mount whose backing process is gone.
    Corrupted,
    /// The path exists but nothing is mounted on it.
    NotAMount,
}

/// Whether an inspection error means the mount is corrupted rather than
/// merely inaccessible.
///
/// Only the stale-handle / dead-transport class counts: a FUSE mount whose
/// daemon exited answers `ENOTCONN`, a vanished NFS-style export `ESTALE`.
pub fn is_corrupted_mount_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(Errno::from_raw),
        Some(Errno::ENOTCONN | Errno::ESTALE | Errno::EIO | Errno::EHOSTDOWN)
    )
}

/// Map a failed mount syscall to the status the orchestrator should see.
fn classify_mount_error(target: &Path, err: io::Error) -> CsiError {
    let msg = format!("bind mount onto {}: {err}", target.display());
    match err.kind() {
        io::ErrorKind::PermissionDenied => CsiError::PermissionDenied(msg),
        io::ErrorKind::InvalidInput => CsiError::InvalidArgument(msg),
        _ => CsiError::Internal(msg),
    }
}

/// Parse `/proc/self/mounts` formatted text.
///
/// Fields are whitespace separated; spaces, tabs, newlines and backslashes
/// inside a field are written as octal escapes (`\040`).  Malformed lines are
/// skipped.
pub fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next().unwrap_or_default();
            Some(MountEntry {
                source: unescape_octal(source),
                mount_point: PathBuf::from(unescape_octal(mount_point)),
                fs_type: unescape_octal(fs_type),
                options: options.to_owned(),
            })
        })
        .collect()
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..=i + 3]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Brings OS mount points into the state a lifecycle phase needs.
pub struct MountPointManager {
    mounter: Arc<dyn Mounter>,
    counters: Arc<TeardownCounters>,
}

impl MountPointManager {
    pub fn new(mounter: Arc<dyn Mounter>, counters: Arc<TeardownCounters>) -> Self {
        Self { mounter, counters }
    }

    /// Classify `path`.
    ///
    /// Inspection errors other than "absent" and the corrupted-mount class
    /// are returned unchanged.
    pub async fn inspect(&self, path: &Path) -> io::Result<MountPointState> {
        match self.mounter.is_mount_point(path).await {
            Ok(true) => Ok(MountPointState::Mounted),
            Ok(false) => Ok(MountPointState::NotAMount),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(MountPointState::Absent),
            Err(e) if is_corrupted_mount_error(&e) => {
                debug!(path = %path.display(), error = %e, "mount point looks corrupted");
                Ok(MountPointState::Corrupted)
            }
            Err(e) => Err(e),
        }
    }

    /// Prepare `path` as a bind-mount target.
    ///
    /// Returns `true` when the caller still has to bind mount, `false` when
    /// `path` is already a valid mount.  A corrupted mount is unmounted once
    /// and reported as needing a bind mount.
    pub async fn ensure_publishable(&self, path: &Path) -> Result<bool, CsiError> {
        let state = self.inspect(path).await.map_err(|e| {
            CsiError::Internal(format!(
                "failed to check if {} is a mount point: {e}",
                path.display()
            ))
        })?;

        match state {
            MountPointState::Mounted => {
                debug!(path = %path.display(), "target already mounted");
                Ok(false)
            }
            MountPointState::NotAMount => Ok(true),
            MountPointState::Absent => {
                self.mounter.create_dir_all(path).await.map_err(|e| {
                    CsiError::Internal(format!("create dir {}: {e}", path.display()))
                })?;
                Ok(true)
            }
            MountPointState::Corrupted => {
                warn!(path = %path.display(), "detected corrupted mount, unmounting");
                self.mounter.unmount(path).await.map_err(|e| {
                    CsiError::Internal(format!(
                        "failed to unmount corrupted path {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(true)
            }
        }
    }

    /// Bind `source` onto `target`, optionally read-only.
    ///
    /// The caller must have checked `target` with [`Self::ensure_publishable`].
    pub async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<(), CsiError> {
        self.mounter
            .bind_mount(source, target)
            .await
            .map_err(|e| classify_mount_error(target, e))?;

        // MS_RDONLY is ignored on the initial bind; it takes a remount.
        if read_only {
            self.mounter
                .remount_read_only(target)
                .await
                .map_err(|e| classify_mount_error(target, e))?;
        }

        info!(
            source = %source.display(),
            target = %target.display(),
            read_only,
            "bind mount established",
        );
        Ok(())
    }

    /// Unmount `path` if needed and remove the directory.
    ///
    /// Best effort: failures are logged and counted, never returned.
    pub async fn cleanup_mount(&self, path: &Path) {
        let state = match self.inspect(path).await {
            Ok(state) => state,
            Err(e) => return self.cleanup_failed(path, "inspect", &e),
        };

        match state {
            MountPointState::Absent => {
                debug!(path = %path.display(), "nothing to clean up");
                return;
            }
            MountPointState::Mounted | MountPointState::Corrupted => {
                if let Err(e) = self.mounter.unmount(path).await {
                    return self.cleanup_failed(path, "unmount", &e);
                }
            }
            MountPointState::NotAMount => {}
        }

        if let Err(e) = self.mounter.remove_dir(path).await {
            return self.cleanup_failed(path, "remove_dir", &e);
        }
        info!(path = %path.display(), "mount point cleaned up");
    }

    /// Unmount `path` without any inspection.  Returns whether it worked.
    pub async fn unmount_best_effort(&self, path: &Path) -> bool {
        match self.mounter.unmount(path).await {
            Ok(()) => {
                info!(path = %path.display(), "unmounted");
                true
            }
            Err(e) => {
                self.cleanup_failed(path, "unmount", &e);
                false
            }
        }
    }

    /// Readiness probe: `path` is a live mount of the bridge filesystem
    /// `fs_name`.
    ///
    /// A bridge that died leaves its mount table entry behind, so the path
    /// itself must answer before the table is consulted.
    pub async fn check_mount_healthy(&self, path: &Path, fs_name: &str) -> Result<(), CsiError> {
        let not_ready = |reason: String| CsiError::MountNotReady {
            path: path.display().to_string(),
            reason,
        };

        match self.inspect(path).await {
            Ok(MountPointState::Mounted) => {}
            Ok(MountPointState::Corrupted) => {
                return Err(not_ready("mount is corrupted, bridge is gone".into()));
            }
            Ok(MountPointState::Absent | MountPointState::NotAMount) => {
                return Err(not_ready("nothing is mounted".into()));
            }
            Err(e) => return Err(not_ready(format!("inspect: {e}"))),
        }

        let entries = self
            .mounter
            .mount_entries()
            .await
            .map_err(|e| not_ready(format!("read mount table: {e}")))?;

        let mut on_path = entries.iter().filter(|e| e.mount_point == path).peekable();
        if on_path.peek().is_none() {
            return Err(not_ready("nothing is mounted".into()));
        }
        if on_path.any(|e| e.source.contains(fs_name) || e.fs_type.contains(fs_name)) {
            debug!(path = %path.display(), fs_name, "bridge mount is ready");
            Ok(())
        } else {
            Err(not_ready(format!("mounted, but not by {fs_name}")))
        }
    }

    fn cleanup_failed(&self, path: &Path, step: &str, err: &dyn fmt::Display) {
        self.counters.record_mount_cleanup_failure();
        warn!(
            path = %path.display(),
            step,
            error = %err,
            cleanup_failed = true,
            "mount cleanup failed",
        );
    }
}
