//! CSI error types.
//!
//! All errors surfaced by the node service are represented by [`CsiError`].
//! Each variant maps to one of the standard RPC status [`Code`]s through
//! [`CsiError::code`], which is what a transport hands back to the
//! orchestrator.  The enum also implements [`Serialize`]/[`Deserialize`] so
//! errors can travel across whatever transport embeds this crate.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RPC status codes returned to the orchestrator.
///
/// Values match the gRPC status code numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    Ok = 0,
    InvalidArgument = 3,
    PermissionDenied = 7,
    Unimplemented = 12,
    Internal = 13,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "Ok",
            Code::InvalidArgument => "InvalidArgument",
            Code::PermissionDenied => "PermissionDenied",
            Code::Unimplemented => "Unimplemented",
            Code::Internal => "Internal",
        };
        f.write_str(name)
    }
}

impl From<Code> for i32 {
    fn from(code: Code) -> i32 {
        code as i32
    }
}

/// Unified error type for CSI node operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// Unexpected OS or object-store failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// A mount operation was rejected by OS permissions.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The caller supplied a malformed request or malformed mount arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not supported by this node plugin.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// The cluster-supplied bridge template is unusable.
    #[error("invalid bridge template {source_name}: {reason}")]
    InvalidTemplate {
        /// Config map the template was read from.
        source_name: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The staging path is not (yet) mounted by the bridge filesystem.
    #[error("mount point {path} is not ready: {reason}")]
    MountNotReady {
        /// Staging path that was probed.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },
}

impl CsiError {
    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Status code reported to the orchestrator for this error.
    pub fn code(&self) -> Code {
        match self {
            Self::Internal(_) | Self::InvalidTemplate { .. } | Self::MountNotReady { .. } => {
                Code::Internal
            }
            Self::PermissionDenied(_) => Code::PermissionDenied,
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::Unimplemented(_) => Code::Unimplemented,
        }
    }
}
