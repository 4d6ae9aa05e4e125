//! Mocks of the Kubernetes seams used by the drivers

use std::collections::BTreeMap;

use async_trait::async_trait;
use mockall::mock;
use serde_json::Value;

use candictl_common::Result;
use candictl_kube::{ClusterStateStore, NodeGroupApi, NodesState};
use candictl_terraform::PipelineOutputs;

mock! {
    pub NodeGroups {}

    #[async_trait]
    impl NodeGroupApi for NodeGroups {
        async fn create_node_group(&self, name: &str, manifest: &Value) -> Result<()>;
        async fn get_cloud_config(&self, group: &str) -> Result<String>;
        async fn wait_for_single_node_ready(&self, node: &str) -> Result<()>;
        async fn wait_for_nodes_list_ready(&self, nodes: &[String]) -> Result<()>;
        async fn wait_for_node_groups_ready(&self, groups: &BTreeMap<String, u32>) -> Result<()>;
        async fn node_exists(&self, node: &str) -> Result<bool>;
    }
}

mock! {
    pub StateStore {}

    #[async_trait]
    impl ClusterStateStore for StateStore {
        async fn get_cluster_state(&self) -> Result<Vec<u8>>;
        async fn get_nodes_state(&self) -> Result<NodesState>;
        async fn save_cluster_state(&self, outputs: &PipelineOutputs) -> Result<()>;
        async fn save_node_state(
            &self,
            node: &str,
            group: &str,
            state: &[u8],
            settings: &[u8],
        ) -> Result<()>;
        async fn save_master_node_state(&self, node: &str, outputs: &PipelineOutputs) -> Result<()>;
        async fn delete_node_state(&self, node: &str) -> Result<()>;
        async fn get_cluster_uuid(&self) -> Result<String>;
        async fn save_intermediate_cluster_state(&self, state: &[u8]) -> Result<()>;
        async fn save_intermediate_node_state(
            &self,
            node: &str,
            group: &str,
            state: &[u8],
            settings: &[u8],
        ) -> Result<()>;
    }
}
