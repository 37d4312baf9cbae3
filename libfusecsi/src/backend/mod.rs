//! Node service implementations.
//!
//! [`bridge::BridgeNodeServer`] implements [`CsiNode`](crate::node::CsiNode)
//! by running the filesystem client in a per-volume bridge pod.

pub mod bridge;
pub mod locks;

pub use bridge::BridgeNodeServer;
