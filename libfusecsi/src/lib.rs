//! # libfusecsi: CSI node plugin for FUSE-mounted cluster filesystems
//!
//! `libfusecsi` implements the node half of a [Container Storage
//! Interface][csi] driver for distributed filesystems that are consumed
//! through a FUSE client.  Instead of running the client inside the plugin,
//! stage starts a *bridge pod* on the node which mounts the filesystem at the
//! staging path; publish then bind-mounts that path into each workload
//! container.  It follows the RK8s conventions (Tokio async runtime,
//! `tracing` for observability, `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Requests, `VolumeId`, `ClusterRef`, capabilities. |
//! | [`error`] | [`CsiError`] and its RPC status [`error::Code`]. |
//! | [`config`] | [`NodeConfig`] loaded from the environment or YAML. |
//! | [`context`] | [`NodeContext`] shared by every lifecycle call. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage. |
//! | [`mount`] | Mount point inspection, bind mounts, corruption recovery. |
//! | [`fusepod`] | Bridge pod template, naming, create / delete. |
//! | [`store`] | [`store::ObjectStore`] seam to the orchestrator API. |
//! | [`backend`] | [`BridgeNodeServer`], the `CsiNode` implementation. |
//! | [`telemetry`] | `tracing` setup and teardown failure counters. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod fusepod;
pub mod mount;
pub mod node;
pub mod store;
pub mod telemetry;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::BridgeNodeServer;
pub use config::NodeConfig;
pub use context::NodeContext;
pub use error::CsiError;
pub use node::CsiNode;
pub use types::*;
