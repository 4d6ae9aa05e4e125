//! IaC state kept in the cluster
//!
//! The base infrastructure state lives in `d8-system/d8-cluster-terraform-state`.
//! Every node ordered by the IaC tool has its own labelled Secret
//! `d8-node-terraform-state-<node>` holding its state and the shape of its node
//! group at creation time. Reads and writes go through a bounded retry loop.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use candictl_common::kube_utils::{create_or_merge, is_already_exists, is_not_found};
use candictl_common::retry::{retry_loop, RetryConfig};
use candictl_common::{Error, MultiError, Result, DECKHOUSE_NAMESPACE, KUBE_SYSTEM_NAMESPACE};
use candictl_terraform::PipelineOutputs;

use crate::manifests::{
    cloud_discovery_patch, cluster_state_patch, cluster_state_secret, master_device_path_patch,
    master_device_path_secret, node_state_patch, node_state_secret, node_state_secret_name,
    CLUSTER_STATE_KEY, CLUSTER_STATE_SECRET, CLUSTER_UUID_CONFIG_MAP, CLUSTER_UUID_KEY,
    MASTERS_DATA_DEVICE_SECRET, NODE_GROUP_LABEL, NODE_GROUP_SETTINGS_KEY, NODE_NAME_LABEL,
    NODE_STATE_KEY, PROVIDER_CONFIG_SECRET, TERRAFORM_STATE_LABEL,
};

/// States of the nodes of one group, read from the cluster
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeGroupTerraformState {
    /// Node name to state blob
    pub state: BTreeMap<String, Vec<u8>>,
    /// Provider settings of the group when its nodes were created
    pub settings: Vec<u8>,
}

/// Node group name to the states of its nodes
pub type NodesState = BTreeMap<String, NodeGroupTerraformState>;

/// Read and write IaC state kept in the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStateStore: Send + Sync {
    /// Base infrastructure state; empty when the cluster has none
    async fn get_cluster_state(&self) -> Result<Vec<u8>>;

    /// States of every node, grouped by node group
    async fn get_nodes_state(&self) -> Result<NodesState>;

    /// Store the base infrastructure state and the provider discovery data
    async fn save_cluster_state(&self, outputs: &PipelineOutputs) -> Result<()>;

    /// Store the state of a non-master node
    async fn save_node_state(
        &self,
        node: &str,
        group: &str,
        state: &[u8],
        settings: &[u8],
    ) -> Result<()>;

    /// Store the state of a master and the path of its data device
    async fn save_master_node_state(&self, node: &str, outputs: &PipelineOutputs) -> Result<()>;

    /// Drop the state of a destroyed node
    async fn delete_node_state(&self, node: &str) -> Result<()>;

    /// Cluster UUID
    async fn get_cluster_uuid(&self) -> Result<String>;

    /// Replace the base infrastructure state while an apply runs
    async fn save_intermediate_cluster_state(&self, state: &[u8]) -> Result<()>;

    /// Replace a node state while an apply runs, creating its Secret if needed
    async fn save_intermediate_node_state(
        &self,
        node: &str,
        group: &str,
        state: &[u8],
        settings: &[u8],
    ) -> Result<()>;
}

/// Build [`NodesState`] from the labelled state Secrets
pub fn group_nodes_state(secrets: &[Secret]) -> NodesState {
    let mut out = NodesState::new();
    for secret in secrets {
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        let labels = secret.metadata.labels.as_ref();
        let group = labels.and_then(|l| l.get(NODE_GROUP_LABEL));
        let node = labels.and_then(|l| l.get(NODE_NAME_LABEL));
        let (Some(group), Some(node)) = (group, node) else {
            warn!(secret = %name, "State secret has no node group or node name label, skipping");
            continue;
        };

        let data = secret.data.as_ref();
        let state = data
            .and_then(|d| d.get(NODE_STATE_KEY))
            .map(|b| b.0.clone())
            .unwrap_or_default();
        let entry = out.entry(group.clone()).or_default();
        if let Some(settings) = data.and_then(|d| d.get(NODE_GROUP_SETTINGS_KEY)) {
            entry.settings = settings.0.clone();
        }
        entry.state.insert(node.clone(), state);
    }
    out
}

/// [`ClusterStateStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStateStore {
    client: Client,
    cancel: CancellationToken,
    reads: RetryConfig,
    writes: RetryConfig,
}

impl std::fmt::Debug for KubeStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStateStore")
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .finish()
    }
}

impl KubeStateStore {
    /// Store on `client`; every loop stops when `cancel` trips
    pub fn new(client: Client, cancel: CancellationToken) -> Self {
        Self {
            client,
            cancel,
            reads: RetryConfig::state_reads(),
            writes: RetryConfig::state_writes(),
        }
    }

    /// Override the retry parameters
    pub fn with_retries(mut self, reads: RetryConfig, writes: RetryConfig) -> Self {
        self.reads = reads;
        self.writes = writes;
        self
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), DECKHOUSE_NAMESPACE)
    }

    async fn upsert_node_secret(
        &self,
        node: &str,
        group: &str,
        state: &[u8],
        settings: &[u8],
    ) -> Result<()> {
        let api = self.secrets();
        create_or_merge(&api, &node_state_secret(node, group, state, settings)).await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterStateStore for KubeStateStore {
    async fn get_cluster_state(&self) -> Result<Vec<u8>> {
        let api = self.secrets();
        let secret = retry_loop(&self.reads, "Get cluster state", &self.cancel, || async {
            Ok(api.get_opt(CLUSTER_STATE_SECRET).await?)
        })
        .await?;

        let state = secret
            .and_then(|s| s.data)
            .and_then(|mut d| d.remove(CLUSTER_STATE_KEY))
            .map(|b| b.0)
            .unwrap_or_default();
        debug!(bytes = state.len(), "Cluster state fetched");
        Ok(state)
    }

    async fn get_nodes_state(&self) -> Result<NodesState> {
        let api = self.secrets();
        let params = ListParams::default().labels(TERRAFORM_STATE_LABEL);
        let secrets = retry_loop(&self.reads, "Get nodes state", &self.cancel, || async {
            Ok(api.list(&params).await?)
        })
        .await?;
        Ok(group_nodes_state(&secrets.items))
    }

    async fn save_cluster_state(&self, outputs: &PipelineOutputs) -> Result<()> {
        if outputs.terraform_state.is_empty() {
            return Err(Error::state_missing("state is not found in outputs"));
        }

        let secrets = self.secrets();
        let config_api: Api<Secret> = Api::namespaced(self.client.clone(), KUBE_SYSTEM_NAMESPACE);
        retry_loop(&self.writes, "Save cluster state", &self.cancel, || async {
            create_or_merge(&secrets, &cluster_state_secret(&outputs.terraform_state)).await?;

            if !outputs.cloud_discovery.is_empty() {
                config_api
                    .patch(
                        PROVIDER_CONFIG_SECRET,
                        &PatchParams::default(),
                        &Patch::Merge(cloud_discovery_patch(&outputs.cloud_discovery)),
                    )
                    .await?;
            }
            Ok(())
        })
        .await?;
        info!("Cluster state saved");
        Ok(())
    }

    async fn save_node_state(
        &self,
        node: &str,
        group: &str,
        state: &[u8],
        settings: &[u8],
    ) -> Result<()> {
        if state.is_empty() {
            return Err(Error::state_missing(format!("state of {} is empty", node)));
        }
        retry_loop(
            &self.writes,
            &format!("Save state of node {}", node),
            &self.cancel,
            || self.upsert_node_secret(node, group, state, settings),
        )
        .await?;
        info!(node = %node, group = %group, "Node state saved");
        Ok(())
    }

    async fn save_master_node_state(&self, node: &str, outputs: &PipelineOutputs) -> Result<()> {
        if outputs.terraform_state.is_empty() {
            return Err(Error::state_missing(format!("state of {} is empty", node)));
        }

        let api = self.secrets();
        retry_loop(
            &self.writes,
            &format!("Save state of master {}", node),
            &self.cancel,
            || async {
                let mut errors = MultiError::new();
                if let Err(e) = self
                    .upsert_node_secret(
                        node,
                        candictl_common::MASTER_NODE_GROUP,
                        &outputs.terraform_state,
                        &[],
                    )
                    .await
                {
                    errors.push(e);
                }

                let device = &outputs.kubernetes_data_device_path;
                let result = match api
                    .create(&PostParams::default(), &master_device_path_secret(node, device))
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(e) if is_already_exists(&e) => api
                        .patch(
                            MASTERS_DATA_DEVICE_SECRET,
                            &PatchParams::default(),
                            &Patch::Merge(master_device_path_patch(node, device)),
                        )
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    errors.push(e.into());
                }
                errors.into_flat_result()
            },
        )
        .await?;
        info!(node = %node, "Master state saved");
        Ok(())
    }

    async fn delete_node_state(&self, node: &str) -> Result<()> {
        let api = self.secrets();
        let name = node_state_secret_name(node);
        retry_loop(
            &self.writes,
            &format!("Delete state of node {}", node),
            &self.cancel,
            || async {
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => Ok(()),
                    Err(e) if is_not_found(&e) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            },
        )
        .await?;
        info!(node = %node, "Node state deleted");
        Ok(())
    }

    async fn get_cluster_uuid(&self) -> Result<String> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), KUBE_SYSTEM_NAMESPACE);
        let cm = retry_loop(&self.reads, "Get cluster UUID", &self.cancel, || async {
            Ok(api.get_opt(CLUSTER_UUID_CONFIG_MAP).await?)
        })
        .await?;

        cm.and_then(|cm| cm.data)
            .and_then(|mut d| d.remove(CLUSTER_UUID_KEY))
            .filter(|uuid| !uuid.is_empty())
            .ok_or_else(|| {
                Error::state_missing(format!(
                    "{}/{} has no {}",
                    KUBE_SYSTEM_NAMESPACE, CLUSTER_UUID_CONFIG_MAP, CLUSTER_UUID_KEY
                ))
            })
    }

    async fn save_intermediate_cluster_state(&self, state: &[u8]) -> Result<()> {
        let api = self.secrets();
        let patch = cluster_state_patch(state);
        retry_loop(
            &self.writes.clone().silent(),
            "Save intermediate cluster state",
            &self.cancel,
            || async {
                api.patch(CLUSTER_STATE_SECRET, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            },
        )
        .await
    }

    async fn save_intermediate_node_state(
        &self,
        node: &str,
        group: &str,
        state: &[u8],
        settings: &[u8],
    ) -> Result<()> {
        let api = self.secrets();
        let name = node_state_secret_name(node);
        let patch = node_state_patch(state);
        retry_loop(
            &self.writes.clone().silent(),
            &format!("Save intermediate state of node {}", node),
            &self.cancel,
            || async {
                match api
                    .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(e) if is_not_found(&e) => {
                        api.create(
                            &PostParams::default(),
                            &node_state_secret(node, group, state, settings),
                        )
                        .await?;
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_group_nodes_state() {
        let secrets = vec![
            node_state_secret("test-master-0", "master", b"m0", b""),
            node_state_secret("test-master-1", "master", b"m1", b""),
            node_state_secret("test-front-0", "front", b"f0", br#"{"name":"front"}"#),
        ];
        let state = group_nodes_state(&secrets);

        assert_eq!(state.len(), 2);
        let master = &state["master"];
        assert_eq!(master.state.len(), 2);
        assert_eq!(master.state["test-master-1"], b"m1".to_vec());
        assert!(master.settings.is_empty());

        let front = &state["front"];
        assert_eq!(front.state["test-front-0"], b"f0".to_vec());
        assert_eq!(front.settings, br#"{"name":"front"}"#.to_vec());
    }

    #[test]
    fn test_group_nodes_state_skips_unlabelled() {
        let unlabelled = Secret {
            metadata: ObjectMeta {
                name: Some("d8-node-terraform-state-orphan".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let state = group_nodes_state(&[unlabelled]);
        assert!(state.is_empty());
    }
}
