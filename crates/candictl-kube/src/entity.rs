//! NodeGroup and Node operations

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::{DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use candictl_common::kube_utils::{build_api_resource, is_already_exists, is_not_found};
use candictl_common::retry::{retry_loop, RetryConfig};
use candictl_common::{Error, Result, CLOUD_INSTANCE_MANAGER_NAMESPACE};

/// API version of NodeGroup
pub const NODE_GROUP_API_VERSION: &str = "deckhouse.io/v1alpha1";
/// Label carrying the node group of a Node
pub const NODE_GROUP_NODE_LABEL: &str = "node.deckhouse.io/group";

const CLOUD_CONFIG_KEY: &str = "cloud-config";

/// Cluster-side operations on node groups and nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeGroupApi: Send + Sync {
    /// Create the NodeGroup, merge-patching it if it exists
    async fn create_node_group(&self, name: &str, manifest: &Value) -> Result<()>;

    /// Base64-encoded bootstrap cloud-config of `group`
    async fn get_cloud_config(&self, group: &str) -> Result<String>;

    /// Wait until `node` is Ready
    async fn wait_for_single_node_ready(&self, node: &str) -> Result<()>;

    /// Wait until every node in `nodes` is Ready
    async fn wait_for_nodes_list_ready(&self, nodes: &[String]) -> Result<()>;

    /// Wait until each group has at least the given number of Ready nodes
    async fn wait_for_node_groups_ready(&self, groups: &BTreeMap<String, u32>) -> Result<()>;

    /// Whether the Node object exists
    async fn node_exists(&self, node: &str) -> Result<bool>;
}

/// Whether the Node reports `Ready=True`
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Count Ready nodes and render a `* name | Ready` table
pub fn readiness_report(nodes: &[Node], desired: usize) -> (usize, String) {
    let ready = nodes.iter().filter(|n| is_node_ready(n)).count();
    let mut message = format!("Nodes Ready {} of {}", ready, desired);
    for node in nodes {
        let condition = if is_node_ready(node) { "Ready" } else { "NotReady" };
        message.push_str(&format!(
            "\n* {} | {}",
            node.metadata.name.as_deref().unwrap_or_default(),
            condition
        ));
    }
    (ready, message)
}

/// Label selector matching the nodes of `groups`
pub fn node_groups_selector<'a>(groups: impl IntoIterator<Item = &'a String>) -> String {
    let names: Vec<&str> = groups.into_iter().map(String::as_str).collect();
    format!("{} in ({})", NODE_GROUP_NODE_LABEL, names.join(", "))
}

/// [`NodeGroupApi`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeNodeGroups {
    client: Client,
    cancel: CancellationToken,
    create_retry: RetryConfig,
    cloud_config_retry: RetryConfig,
    ready_retry: RetryConfig,
}

impl std::fmt::Debug for KubeNodeGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeNodeGroups").finish_non_exhaustive()
    }
}

impl KubeNodeGroups {
    /// Operations on `client`; every wait stops when `cancel` trips
    pub fn new(client: Client, cancel: CancellationToken) -> Self {
        Self {
            client,
            cancel,
            create_retry: RetryConfig::new(45, Duration::from_secs(15)),
            cloud_config_retry: RetryConfig::new(60, Duration::from_secs(10)).silent(),
            ready_retry: RetryConfig::new(100, Duration::from_secs(20)),
        }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl NodeGroupApi for KubeNodeGroups {
    async fn create_node_group(&self, name: &str, manifest: &Value) -> Result<()> {
        let ar = build_api_resource(NODE_GROUP_API_VERSION, "NodeGroup");
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let obj: DynamicObject = serde_json::from_value(manifest.clone())
            .map_err(|e| Error::serialization_for("NodeGroup", e.to_string()))?;

        retry_loop(
            &self.create_retry,
            &format!("Create NodeGroup {:?}", name),
            &self.cancel,
            || async {
                match api.create(&PostParams::default(), &obj).await {
                    Ok(_) => {
                        info!("NodeGroup {:?} created", name);
                        Ok(())
                    }
                    Err(e) if is_already_exists(&e) => {
                        info!("NodeGroup {:?} exists, updating", name);
                        api.patch(name, &PatchParams::default(), &Patch::Merge(manifest))
                            .await?;
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            },
        )
        .await
    }

    async fn get_cloud_config(&self, group: &str) -> Result<String> {
        let api: Api<Secret> =
            Api::namespaced(self.client.clone(), CLOUD_INSTANCE_MANAGER_NAMESPACE);
        let name = format!("manual-bootstrap-for-{}", group);
        let operation = format!("Waiting for {} cloud config", group);

        let cloud_config = retry_loop(&self.cloud_config_retry, &operation, &self.cancel, || async {
            let secret = api.get(&name).await?;
            secret
                .data
                .and_then(|mut d| d.remove(CLOUD_CONFIG_KEY))
                .map(|b| b.0)
                .ok_or_else(|| {
                    Error::kube_api(
                        format!("get secret {}", name),
                        format!("no {} key", CLOUD_CONFIG_KEY),
                    )
                })
        })
        .await?;

        info!("Cloud configuration for {} found", group);
        Ok(base64::engine::general_purpose::STANDARD.encode(cloud_config))
    }

    async fn wait_for_single_node_ready(&self, node: &str) -> Result<()> {
        let api = self.nodes();
        retry_loop(
            &self.ready_retry,
            &format!("Waiting for Node {} to become Ready", node),
            &self.cancel,
            || async {
                let obj = api.get(node).await?;
                if is_node_ready(&obj) {
                    Ok(())
                } else {
                    Err(Error::node_not_ready(format!("node {:?} is not Ready yet", node)))
                }
            },
        )
        .await
    }

    async fn wait_for_nodes_list_ready(&self, nodes: &[String]) -> Result<()> {
        let api = self.nodes();
        retry_loop(
            &self.ready_retry,
            "Waiting for nodes to become Ready",
            &self.cancel,
            || async {
                let mut objs = Vec::with_capacity(nodes.len());
                for node in nodes {
                    objs.push(api.get(node).await?);
                }
                let (ready, message) = readiness_report(&objs, nodes.len());
                if ready >= nodes.len() {
                    info!("{}", message);
                    Ok(())
                } else {
                    Err(Error::node_not_ready(message))
                }
            },
        )
        .await
    }

    async fn wait_for_node_groups_ready(&self, groups: &BTreeMap<String, u32>) -> Result<()> {
        let api = self.nodes();
        let desired: usize = groups.values().map(|n| *n as usize).sum();
        let params = ListParams::default().labels(&node_groups_selector(groups.keys()));
        let names: Vec<&str> = groups.keys().map(String::as_str).collect();

        retry_loop(
            &self.ready_retry,
            &format!("Waiting for NodeGroups {:?} to become Ready", names),
            &self.cancel,
            || async {
                let list = api.list(&params).await?;
                let (ready, message) = readiness_report(&list.items, desired);
                if ready >= desired {
                    info!("{}", message);
                    Ok(())
                } else {
                    Err(Error::node_not_ready(message))
                }
            },
        )
        .await
    }

    async fn node_exists(&self, node: &str) -> Result<bool> {
        let api = self.nodes();
        retry_loop(
            &RetryConfig::new(5, Duration::from_secs(2)),
            &format!("Checking node exists {}", node),
            &self.cancel,
            || async {
                match api.get(node).await {
                    Ok(_) => Ok(true),
                    Err(e) if is_not_found(&e) => Ok(false),
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
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(name: &str, ready: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: ready.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_is_node_ready() {
        assert!(is_node_ready(&node("a", "True")));
        assert!(!is_node_ready(&node("a", "False")));
        assert!(!is_node_ready(&Node::default()));
    }

    #[test]
    fn test_readiness_report() {
        let nodes = vec![node("test-master-0", "True"), node("test-front-0", "Unknown")];
        let (ready, message) = readiness_report(&nodes, 3);
        assert_eq!(ready, 1);
        assert_eq!(
            message,
            "Nodes Ready 1 of 3\n* test-master-0 | Ready\n* test-front-0 | NotReady"
        );
    }

    #[test]
    fn test_node_groups_selector() {
        let groups = BTreeMap::from([("front".to_string(), 2u32), ("master".to_string(), 1)]);
        assert_eq!(
            node_groups_selector(groups.keys()),
            "node.deckhouse.io/group in (front, master)"
        );
    }
}
