//! Intermediate state destinations streaming into the cluster

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use candictl_common::Result;
use candictl_terraform::StateDestination;

use crate::state_store::ClusterStateStore;

/// Streams the base infrastructure state into `d8-cluster-terraform-state`
pub struct ClusterStateSaver {
    store: Arc<dyn ClusterStateStore>,
}

impl ClusterStateSaver {
    /// Saver writing through `store`
    pub fn new(store: Arc<dyn ClusterStateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StateDestination for ClusterStateSaver {
    async fn save_state(&self, state: &[u8]) -> Result<()> {
        if state.is_empty() {
            return Ok(());
        }
        debug!(bytes = state.len(), "Saving intermediate cluster state");
        self.store.save_intermediate_cluster_state(state).await
    }
}

/// Streams a node state into `d8-node-terraform-state-<node>`
pub struct NodeStateSaver {
    store: Arc<dyn ClusterStateStore>,
    node: String,
    group: String,
    settings: Vec<u8>,
}

impl NodeStateSaver {
    /// Saver for `node` of `group`; `settings` are used if the Secret is created
    pub fn new(
        store: Arc<dyn ClusterStateStore>,
        node: impl Into<String>,
        group: impl Into<String>,
        settings: Vec<u8>,
    ) -> Self {
        Self {
            store,
            node: node.into(),
            group: group.into(),
            settings,
        }
    }
}

#[async_trait]
impl StateDestination for NodeStateSaver {
    async fn save_state(&self, state: &[u8]) -> Result<()> {
        if state.is_empty() {
            return Ok(());
        }
        debug!(node = %self.node, bytes = state.len(), "Saving intermediate node state");
        self.store
            .save_intermediate_node_state(&self.node, &self.group, state, &self.settings)
            .await
    }
}
