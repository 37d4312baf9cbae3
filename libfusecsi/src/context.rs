//! Per-node context shared by every lifecycle operation.

use std::sync::Arc;

use crate::config::NodeConfig;
use crate::store::ObjectStore;

/// Everything a lifecycle operation needs to know about the node it runs on.
///
/// Cheap to clone; the store and configuration are shared.
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: String,
    pub store: Arc<dyn ObjectStore>,
    pub config: Arc<NodeConfig>,
}

impl NodeContext {
    pub fn new(config: NodeConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            node_id: config.node_id.clone(),
            store,
            config: Arc::new(config),
        }
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
