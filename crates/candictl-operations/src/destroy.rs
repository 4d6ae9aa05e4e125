//! Destroy of a running cluster
//!
//! Everything read from the cluster is checkpointed in a local cache first,
//! so a re-run can finish the infrastructure destroy after the cluster is gone.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use kube::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, Instrument};

use candictl_common::cache::Cache;
use candictl_common::input::Prompter;
use candictl_common::teardown::Teardown;
use candictl_common::{Error, Result};
use candictl_config::naming::node_index;
use candictl_config::parse::parse_config_from_cluster;
use candictl_config::{MetaConfig, SchemaStore};
use candictl_kube::cluster_config::get_cluster_config_data;
use candictl_kube::{ClusterCleaner, ClusterStateStore, KubeStateStore, NodeGroupTerraformState, NodesState};
use candictl_terraform::RunnerFactory;

use crate::abort::{destroy_order, InfraDestroyer, NodeToDestroy};
use crate::session::{KubeAccess, KubeSession};

/// Cache key of the configuration documents
pub const CLUSTER_CONFIG_CACHE_KEY: &str = "cluster-config";
/// Cache key of the node states
pub const NODES_STATE_CACHE_KEY: &str = "nodes-state";
/// Cache key of the base infrastructure state
pub const CLUSTER_STATE_CACHE_KEY: &str = "cluster-state";
/// Cache key of the cluster UUID
pub const UUID_CACHE_KEY: &str = "uuid";

/// Configuration documents as stored in the cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedClusterConfig {
    /// `ClusterConfiguration` YAML
    pub cluster_config: String,
    /// Provider configuration YAML
    pub provider_cluster_config: String,
}

/// Node states of one group in cache form
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedGroupState {
    /// Node name to state
    pub state: BTreeMap<String, Vec<u8>>,
    /// Group settings
    pub settings: Vec<u8>,
}

/// Convert node states for the cache
pub fn to_cached(nodes: &NodesState) -> BTreeMap<String, CachedGroupState> {
    nodes
        .iter()
        .map(|(group, s)| {
            (
                group.clone(),
                CachedGroupState {
                    state: s.state.clone(),
                    settings: s.settings.clone(),
                },
            )
        })
        .collect()
}

/// Convert cached node states back
pub fn from_cached(cached: BTreeMap<String, CachedGroupState>) -> NodesState {
    cached
        .into_iter()
        .map(|(group, s)| {
            (
                group,
                NodeGroupTerraformState {
                    state: s.state,
                    settings: s.settings,
                },
            )
        })
        .collect()
}

/// Flatten node states into the destroy order
pub fn nodes_to_destroy(nodes: &NodesState) -> Vec<NodeToDestroy> {
    let mut out = Vec::new();
    for (group, states) in nodes {
        for (name, state) in &states.state {
            let Some(index) = node_index(name) else {
                tracing::warn!(node = %name, "Node name has no index suffix, skipping");
                continue;
            };
            out.push(NodeToDestroy {
                group: group.clone(),
                name: name.clone(),
                index,
                state: Some(state.clone()),
                settings: states.settings.clone(),
            });
        }
    }
    destroy_order(out)
}

/// Reuse `key` from the cache when the operator agrees, otherwise fetch it
/// and store it.
pub async fn checkpoint<T, F, Fut>(
    cache: &Cache,
    prompter: &dyn Prompter,
    key: &str,
    label: &str,
    fetch: F,
) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if cache.in_cache(key)
        && prompter.confirm(
            &format!("Do you want to continue with {} from local cache?", label),
            true,
        )
    {
        info!(key = %key, "Using {} from local cache", label);
        return cache.load_struct(key);
    }
    let value = fetch().await?;
    cache.save_struct(key, &value)?;
    Ok(value)
}

struct LazySession {
    access: KubeAccess,
    session: Option<KubeSession>,
}

impl LazySession {
    async fn client(&mut self) -> Result<Client> {
        if let Some(session) = &self.session {
            return Ok(session.client());
        }
        let session = KubeSession::connect(&self.access).await?;
        let client = session.client();
        self.session = Some(session);
        Ok(client)
    }

    async fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stop().await;
        }
    }
}

/// Destroy driver options
#[derive(Debug, Clone, Default)]
pub struct DestroyOptions {
    /// Leave in-cluster resources alone
    pub skip_resources: bool,
    /// Destroy without asking
    pub auto_approve: bool,
}

/// Drives the destroy of a running cluster
pub struct ClusterDestroyer {
    access: KubeAccess,
    factory: RunnerFactory,
    teardown: Arc<Teardown>,
    prompter: Arc<dyn Prompter>,
    schema_store: Arc<SchemaStore>,
    options: DestroyOptions,
}

impl ClusterDestroyer {
    /// Destroyer reaching the cluster through `access`. The factory cache is
    /// used for the checkpoints.
    pub fn new(
        access: KubeAccess,
        factory: RunnerFactory,
        teardown: Arc<Teardown>,
        prompter: Arc<dyn Prompter>,
        schema_store: Arc<SchemaStore>,
        options: DestroyOptions,
    ) -> Self {
        Self {
            access,
            factory,
            teardown,
            prompter,
            schema_store,
            options,
        }
    }

    /// Run the destroy
    pub async fn run(&self) -> Result<()> {
        let mut lazy = LazySession {
            access: self.access.clone(),
            session: None,
        };
        let result = self.destroy(&mut lazy).await;
        lazy.stop().await;
        result
    }

    async fn destroy(&self, lazy: &mut LazySession) -> Result<()> {
        let cache = self.factory.cache().clone();
        let cancel = self.teardown.cancellation_token();
        let cancel_ref = &cancel;
        let prompter = self.prompter.as_ref();

        let session = &mut *lazy;
        let docs: CachedClusterConfig =
            checkpoint(&cache, prompter, CLUSTER_CONFIG_CACHE_KEY, "cluster config", move || async move {
                let client = session.client().await?;
                let data = get_cluster_config_data(&client, cancel_ref).await?;
                Ok(CachedClusterConfig {
                    cluster_config: into_utf8("ClusterConfiguration", data.cluster_config)?,
                    provider_cluster_config: into_utf8("ProviderClusterConfiguration", data.provider_cluster_config)?,
                })
            })
            .await?;
        let mut meta = parse_config_from_cluster(
            &docs.cluster_config,
            Some(&docs.provider_cluster_config),
            &self.schema_store,
        )?;

        let (nodes, cluster_state) = if meta.is_cloud() {
            let session = &mut *lazy;
            let nodes = checkpoint(&cache, prompter, NODES_STATE_CACHE_KEY, "nodes state", move || async move {
                let store = KubeStateStore::new(session.client().await?, cancel_ref.clone());
                Ok(to_cached(&store.get_nodes_state().await?))
            })
            .await?;
            let session = &mut *lazy;
            let cluster_state: Vec<u8> =
                checkpoint(&cache, prompter, CLUSTER_STATE_CACHE_KEY, "cluster state", move || async move {
                    let store = KubeStateStore::new(session.client().await?, cancel_ref.clone());
                    store.get_cluster_state().await
                })
                .await?;
            (from_cached(nodes), cluster_state)
        } else {
            (NodesState::new(), Vec::new())
        };

        let session = &mut *lazy;
        meta.uuid = checkpoint(&cache, prompter, UUID_CACHE_KEY, "cluster UUID", move || async move {
            let store = KubeStateStore::new(session.client().await?, cancel_ref.clone());
            store.get_cluster_uuid().await
        })
        .await?;

        if self.options.skip_resources {
            info!("[Destroy] Skipping in-cluster resources");
        } else {
            let cleaner = ClusterCleaner::new(lazy.client().await?, cancel.clone(), self.prompter.clone());
            cleaner
                .delete_resources()
                .instrument(info_span!("destroy", phase = "Kubernetes resources"))
                .await?;
        }
        lazy.stop().await;

        if meta.is_cloud() {
            self.destroy_infrastructure(Arc::new(meta), &nodes, &cluster_state)
                .await?;
        } else {
            info!("[Destroy] Static cluster has no infrastructure to destroy");
        }

        cache.clean()?;
        info!("[Destroy] Done");
        Ok(())
    }

    async fn destroy_infrastructure(
        &self,
        meta: Arc<MetaConfig>,
        nodes: &NodesState,
        cluster_state: &[u8],
    ) -> Result<()> {
        let destroyer = InfraDestroyer::new(meta, self.factory.clone(), self.options.auto_approve);
        let nodes = nodes_to_destroy(nodes);
        info!(nodes = nodes.len(), "[Destroy] Destroying nodes");
        destroyer.destroy_nodes(&nodes).await?;

        info!("[Destroy] Destroying base infrastructure");
        destroyer.destroy_base_infra(Some(cluster_state)).await
    }
}

fn into_utf8(document: &str, data: Vec<u8>) -> Result<String> {
    String::from_utf8(data).map_err(|e| Error::config_invalid_in(document, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candictl_common::input::StaticPrompter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn nodes() -> NodesState {
        NodesState::from([
            (
                "master".to_string(),
                NodeGroupTerraformState {
                    state: BTreeMap::from([
                        ("test-master-0".to_string(), b"m0".to_vec()),
                        ("test-master-1".to_string(), b"m1".to_vec()),
                    ]),
                    settings: Vec::new(),
                },
            ),
            (
                "worker".to_string(),
                NodeGroupTerraformState {
                    state: BTreeMap::from([
                        ("test-worker-0".to_string(), b"w0".to_vec()),
                        ("test-worker-broken".to_string(), b"x".to_vec()),
                    ]),
                    settings: b"{\"name\":\"worker\"}".to_vec(),
                },
            ),
        ])
    }

    #[test]
    fn test_nodes_to_destroy_order() {
        let order = nodes_to_destroy(&nodes());
        let names: Vec<&str> = order.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["test-worker-0", "test-master-1", "test-master-0"]);
        assert_eq!(order[0].state.as_deref(), Some(&b"w0"[..]));
        assert_eq!(order[0].settings, b"{\"name\":\"worker\"}");
    }

    #[test]
    fn test_nodes_state_cache_form() {
        let original = nodes();
        assert_eq!(from_cached(to_cached(&original)), original);
    }

    #[tokio::test]
    async fn test_checkpoint_fetches_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open_dir(dir.path()).unwrap();
        let fetches = AtomicUsize::new(0);

        for _ in 0..2 {
            let counter = &fetches;
            let value: Vec<u8> = checkpoint(&cache, &StaticPrompter(true), CLUSTER_STATE_CACHE_KEY, "cluster state", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(b"state".to_vec())
            })
            .await
            .unwrap();
            assert_eq!(value, b"state");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_declined_refetches() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open_dir(dir.path()).unwrap();
        cache.save_struct(UUID_CACHE_KEY, &"old".to_string()).unwrap();

        let value: String = checkpoint(&cache, &StaticPrompter(false), UUID_CACHE_KEY, "cluster UUID", || async {
            Ok("new".to_string())
        })
        .await
        .unwrap();
        assert_eq!(value, "new");
        let stored: String = cache.load_struct(UUID_CACHE_KEY).unwrap();
        assert_eq!(stored, "new");
    }

    #[tokio::test]
    async fn test_checkpoint_fetch_error_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open_dir(dir.path()).unwrap();
        let result: Result<String> = checkpoint(&cache, &StaticPrompter(true), UUID_CACHE_KEY, "cluster UUID", || async {
            Err(Error::state_missing("no uuid"))
        })
        .await;
        assert!(result.is_err());
        assert!(!cache.in_cache(UUID_CACHE_KEY));
    }
}
