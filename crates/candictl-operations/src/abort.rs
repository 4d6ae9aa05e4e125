//! Unwinding infrastructure: node inventory from the local cache and the
//! destroy order shared by bootstrap abort and cluster destroy

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, info_span, warn, Instrument};

use candictl_common::cache::{Cache, STATE_SUFFIX};
use candictl_common::{Result, MASTER_NODE_GROUP};
use candictl_config::naming::split_node_name;
use candictl_config::MetaConfig;
use candictl_terraform::{destroy_pipeline, NodeRunnerSpec, RunnerFactory, RunnerOptions, BASE_INFRA_STEP};

/// Group name to node index to node name
pub type CachedNodes = BTreeMap<String, BTreeMap<u32, String>>;

/// One node scheduled for destroy
#[derive(Debug, Clone, PartialEq)]
pub struct NodeToDestroy {
    /// Node group
    pub group: String,
    /// Node name
    pub name: String,
    /// Numeric suffix of the name
    pub index: u32,
    /// State to destroy from; `None` reads the local cache
    pub state: Option<Vec<u8>>,
    /// Group settings captured when the node was created
    pub settings: Vec<u8>,
}

/// Recover the nodes ordered during a bootstrap from the names of cached
/// states.
pub fn nodes_from_cache(cache: &Cache, prefix: &str) -> Result<CachedNodes> {
    let mut nodes = CachedNodes::new();
    cache.iterate(|file, _| {
        let Some(name) = file.strip_suffix(STATE_SUFFIX) else {
            return Ok(());
        };
        if name.starts_with(BASE_INFRA_STEP) || name.starts_with("uuid") {
            return Ok(());
        }
        match split_node_name(prefix, name) {
            Some((group, index)) => {
                nodes.entry(group).or_default().insert(index, name.to_string());
            }
            None => warn!(entry = %file, "Cache entry is not a node state, skipping"),
        }
        Ok(())
    })?;
    Ok(nodes)
}

/// Non-master groups alphabetically, then masters; highest index first within
/// a group.
pub fn destroy_order(mut nodes: Vec<NodeToDestroy>) -> Vec<NodeToDestroy> {
    nodes.sort_by(|a, b| {
        let a_master = a.group == MASTER_NODE_GROUP;
        let b_master = b.group == MASTER_NODE_GROUP;
        a_master
            .cmp(&b_master)
            .then_with(|| a.group.cmp(&b.group))
            .then_with(|| b.index.cmp(&a.index))
    });
    nodes
}

/// Nodes from the cache inventory, states read from the cache
pub fn cached_nodes_to_destroy(meta: &MetaConfig, nodes: &CachedNodes) -> Result<Vec<NodeToDestroy>> {
    let mut out = Vec::new();
    for (group, members) in nodes {
        let settings = match meta.find_terra_node_group(group) {
            Some(settings) if group != MASTER_NODE_GROUP => serde_json::to_vec(&settings)?,
            _ => Vec::new(),
        };
        for (index, name) in members {
            out.push(NodeToDestroy {
                group: group.clone(),
                name: name.clone(),
                index: *index,
                state: None,
                settings: settings.clone(),
            });
        }
    }
    Ok(destroy_order(out))
}

/// Destroys nodes and the base infrastructure with the IaC tool
pub struct InfraDestroyer {
    meta: Arc<MetaConfig>,
    factory: RunnerFactory,
    auto_approve: bool,
}

impl InfraDestroyer {
    /// Destroyer for the cluster described by `meta`
    pub fn new(meta: Arc<MetaConfig>, factory: RunnerFactory, auto_approve: bool) -> Self {
        Self {
            meta,
            factory,
            auto_approve,
        }
    }

    fn options(&self, state: Option<&[u8]>) -> RunnerOptions {
        let opts = RunnerOptions::default()
            .auto_approve(self.auto_approve)
            .allowed_cached_state(true);
        match state {
            Some(state) => opts.with_state(state),
            None => opts,
        }
    }

    /// Destroy `nodes` in the given order, stopping at the first failure
    pub async fn destroy_nodes(&self, nodes: &[NodeToDestroy]) -> Result<()> {
        for node in nodes {
            let spec = NodeRunnerSpec::new(&node.group, node.index, "");
            let mut runner = self.factory.node_destroy(
                &self.meta,
                &spec,
                &node.settings,
                self.options(node.state.as_deref()),
            )?;
            destroy_pipeline(&mut runner, &node.name)
                .instrument(info_span!("destroy", node = %node.name))
                .await?;
        }
        Ok(())
    }

    /// Destroy the base infrastructure
    pub async fn destroy_base_infra(&self, state: Option<&[u8]>) -> Result<()> {
        let mut runner = self.factory.base_infra(&self.meta, self.options(state))?;
        destroy_pipeline(&mut runner, "Kubernetes cluster")
            .instrument(info_span!("destroy", phase = "Base infrastructure"))
            .await
    }
}

/// Unwind a failed bootstrap using only the local cache
pub async fn abort_bootstrap(meta: Arc<MetaConfig>, factory: RunnerFactory, auto_approve: bool) -> Result<()> {
    let cache = factory.cache().clone();
    if !meta.is_cloud() {
        info!("[Abort] Static cluster has no infrastructure to destroy");
        return cache.clean();
    }

    let inventory = nodes_from_cache(&cache, &meta.cluster_prefix)?;
    let nodes = cached_nodes_to_destroy(&meta, &inventory)?;
    info!(nodes = nodes.len(), "[Abort] Destroying nodes found in cache");

    let destroyer = InfraDestroyer::new(meta, factory, auto_approve);
    destroyer.destroy_nodes(&nodes).await?;

    info!("[Abort] Destroying base infrastructure");
    destroyer.destroy_base_infra(None).await?;

    cache.clean()?;
    info!("[Abort] Done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(group: &str, index: u32) -> NodeToDestroy {
        NodeToDestroy {
            group: group.into(),
            name: format!("test-{}-{}", group, index),
            index,
            state: None,
            settings: Vec::new(),
        }
    }

    #[test]
    fn test_nodes_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open_dir(dir.path()).unwrap();
        for file in [
            "test-master-0.tfstate",
            "test-master-1.tfstate",
            "test-static-ingress-0.tfstate",
            "base-infrastructure.tfstate",
            "uuid.tfstate",
            "test-master-1.tfstate.backup",
            "some_trash",
            "test-master-without-index.tfstate",
        ] {
            std::fs::write(dir.path().join(file), b"{}").unwrap();
        }

        let nodes = nodes_from_cache(&cache, "test").unwrap();
        let expected = CachedNodes::from([
            (
                "master".to_string(),
                BTreeMap::from([(0, "test-master-0".to_string()), (1, "test-master-1".to_string())]),
            ),
            (
                "static-ingress".to_string(),
                BTreeMap::from([(0, "test-static-ingress-0".to_string())]),
            ),
        ]);
        assert_eq!(nodes, expected);
    }

    #[test]
    fn test_destroy_order_masters_last() {
        let ordered = destroy_order(vec![
            node("master", 0),
            node("master", 2),
            node("worker", 0),
            node("front", 1),
            node("worker", 10),
            node("worker", 9),
        ]);
        let names: Vec<&str> = ordered.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "test-front-1",
                "test-worker-10",
                "test-worker-9",
                "test-worker-0",
                "test-master-2",
                "test-master-0",
            ]
        );
    }

    #[test]
    fn test_cached_nodes_use_declared_settings() {
        let meta = MetaConfig {
            cluster_prefix: "test".into(),
            terra_node_group_specs: vec![candictl_config::meta::TerraNodeGroupSpec {
                name: "worker".into(),
                replicas: 1,
                ..Default::default()
            }],
            provider_cluster_config: serde_json::from_value(serde_json::json!({
                "nodeGroups": [{ "name": "worker", "replicas": 1 }]
            }))
            .unwrap(),
            ..Default::default()
        };
        let inventory = CachedNodes::from([
            ("master".to_string(), BTreeMap::from([(0, "test-master-0".to_string())])),
            ("worker".to_string(), BTreeMap::from([(0, "test-worker-0".to_string())])),
        ]);

        let nodes = cached_nodes_to_destroy(&meta, &inventory).unwrap();
        assert_eq!(nodes[0].name, "test-worker-0");
        let settings: serde_json::Value = serde_json::from_slice(&nodes[0].settings).unwrap();
        assert_eq!(settings["name"], "worker");
        assert_eq!(nodes[1].name, "test-master-0");
        assert!(nodes[1].settings.is_empty());
    }
}
