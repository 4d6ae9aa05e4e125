//! Read-only comparison of the declared configuration with the IaC state

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use candictl_common::{Error, Result, MASTER_NODE_GROUP};
use candictl_config::naming::node_index;
use candictl_config::MetaConfig;
use candictl_kube::{ClusterStateStore, NodeGroupApi};
use candictl_terraform::{check_pipeline, NodeRunnerSpec, RunnerFactory, RunnerOptions};

/// Outcome for one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Matches the configuration
    Ok,
    /// Fewer nodes than declared
    Insufficient,
    /// More nodes than declared
    Excessive,
    /// The plan has changes
    Changed,
    /// The check failed
    Error,
}

impl CheckStatus {
    /// Every status, in label order
    pub const ALL: [CheckStatus; 5] = [
        CheckStatus::Ok,
        CheckStatus::Insufficient,
        CheckStatus::Excessive,
        CheckStatus::Changed,
        CheckStatus::Error,
    ];

    /// Label value
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Insufficient => "insufficient",
            Self::Excessive => "excessive",
            Self::Changed => "changed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base infrastructure result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterCheckResult {
    /// Status
    pub status: CheckStatus,
}

/// Node group result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroupCheckResult {
    /// Group name
    pub name: String,
    /// Status
    pub status: CheckStatus,
}

/// Node result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCheckResult {
    /// Node group
    pub group: String,
    /// Node name
    pub name: String,
    /// Status
    pub status: CheckStatus,
}

/// Everything one check found
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Base infrastructure
    pub cluster: ClusterCheckResult,
    /// Node groups
    pub node_groups: Vec<NodeGroupCheckResult>,
    /// Nodes
    pub nodes: Vec<NodeCheckResult>,
}

/// Output format of `terraform check`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// YAML
    #[default]
    Yaml,
    /// JSON
    Json,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "yaml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            other => Err(Error::config_invalid(format!(
                "unknown output format {:?}, expected yaml or json",
                other
            ))),
        }
    }
}

impl Statistics {
    /// Render in `format`
    pub fn render(&self, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Yaml => {
                serde_yaml::to_string(self).map_err(|e| Error::serialization(e.to_string()))
            }
            OutputFormat::Json => Ok(serde_json::to_string_pretty(self)?),
        }
    }
}

/// Status of a group from its declared and actual sizes
pub fn node_group_status(declared: u32, actual: usize) -> CheckStatus {
    let declared = declared as usize;
    match declared.cmp(&actual) {
        std::cmp::Ordering::Greater => CheckStatus::Insufficient,
        std::cmp::Ordering::Less => CheckStatus::Excessive,
        std::cmp::Ordering::Equal => CheckStatus::Ok,
    }
}

fn plan_status(result: Result<bool>, entity: &str) -> CheckStatus {
    match result {
        Ok(true) => CheckStatus::Changed,
        Ok(false) => CheckStatus::Ok,
        Err(e) => {
            warn!(entity = %entity, error = %e, "Check failed");
            CheckStatus::Error
        }
    }
}

/// Plans infrastructure without applying it
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfraChecker: Send + Sync {
    /// Whether the base infrastructure plan has changes
    async fn check_cluster(&self, state: &[u8]) -> Result<bool>;

    /// Whether the plan of one node has changes
    async fn check_node(
        &self,
        group: &str,
        index: u32,
        state: &[u8],
        settings: &[u8],
        cloud_config: &str,
    ) -> Result<bool>;
}

/// Check the cluster described by `meta`
pub async fn check_state(
    meta: &MetaConfig,
    store: &dyn ClusterStateStore,
    node_groups: &dyn NodeGroupApi,
    checker: &dyn InfraChecker,
) -> Result<Statistics> {
    let cluster_state = store.get_cluster_state().await?;
    let cluster = ClusterCheckResult {
        status: plan_status(checker.check_cluster(&cluster_state).await, "base-infrastructure"),
    };

    let nodes_state = store.get_nodes_state().await?;

    let mut declared: Vec<(String, u32)> =
        vec![(MASTER_NODE_GROUP.to_string(), meta.master_node_group_spec.replicas)];
    declared.extend(
        meta.terra_node_group_specs
            .iter()
            .map(|ng| (ng.name.clone(), ng.replicas)),
    );
    let declared_names: BTreeSet<&String> = declared.iter().map(|(n, _)| n).collect();

    let mut groups = Vec::new();
    for (name, replicas) in &declared {
        // A declared group without any state is never complete.
        let status = match nodes_state.get(name) {
            Some(state) => node_group_status(*replicas, state.state.len()),
            None => CheckStatus::Insufficient,
        };
        groups.push(NodeGroupCheckResult {
            name: name.clone(),
            status,
        });
    }
    for (name, state) in &nodes_state {
        if !declared_names.contains(name) {
            groups.push(NodeGroupCheckResult {
                name: name.clone(),
                status: node_group_status(0, state.state.len()),
            });
        }
    }

    let mut nodes = Vec::new();
    for (group, state) in &nodes_state {
        let cloud_config = if declared_names.contains(group) {
            match node_groups.get_cloud_config(group).await {
                Ok(cc) => cc,
                Err(e) => {
                    warn!(group = %group, error = %e, "Unable to read cloud config");
                    String::new()
                }
            }
        } else {
            String::new()
        };

        for (name, node_state) in &state.state {
            let status = match node_index(name) {
                Some(index) => plan_status(
                    checker
                        .check_node(group, index, node_state, &state.settings, &cloud_config)
                        .await,
                    name,
                ),
                None => {
                    warn!(node = %name, "Node name has no index suffix");
                    CheckStatus::Error
                }
            };
            debug!(node = %name, status = %status, "Node checked");
            nodes.push(NodeCheckResult {
                group: group.clone(),
                name: name.clone(),
                status,
            });
        }
    }

    Ok(Statistics {
        cluster,
        node_groups: groups,
        nodes,
    })
}

/// [`InfraChecker`] running `terraform plan`
pub struct TerraformInfraChecker {
    meta: Arc<MetaConfig>,
    factory: RunnerFactory,
}

impl TerraformInfraChecker {
    /// Checker for `meta`. The factory should carry a dummy cache.
    pub fn new(meta: Arc<MetaConfig>, factory: RunnerFactory) -> Self {
        Self { meta, factory }
    }

    fn options(state: &[u8]) -> RunnerOptions {
        RunnerOptions::default()
            .with_state(state)
            .allowed_cached_state(true)
    }
}

#[async_trait]
impl InfraChecker for TerraformInfraChecker {
    async fn check_cluster(&self, state: &[u8]) -> Result<bool> {
        let mut runner = self.factory.base_infra(&self.meta, Self::options(state))?;
        check_pipeline(&mut runner, "Kubernetes cluster").await
    }

    async fn check_node(
        &self,
        group: &str,
        index: u32,
        state: &[u8],
        settings: &[u8],
        cloud_config: &str,
    ) -> Result<bool> {
        let spec = NodeRunnerSpec::new(group, index, cloud_config);
        let mut runner = if self.meta.declared_replicas(group).is_some() {
            self.factory.node(&self.meta, &spec, Self::options(state))?
        } else {
            self.factory
                .node_destroy(&self.meta, &spec, settings, Self::options(state))?
        };
        let name = runner.name().to_string();
        check_pipeline(&mut runner, &name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockNodeGroups, MockStateStore};
    use candictl_config::TerraNodeGroupSpec;
    use candictl_kube::{NodeGroupTerraformState, NodesState};
    use std::collections::BTreeMap;

    fn group(names: &[&str]) -> NodeGroupTerraformState {
        NodeGroupTerraformState {
            state: names.iter().map(|n| (n.to_string(), b"{}".to_vec())).collect(),
            settings: Vec::new(),
        }
    }

    #[test]
    fn test_node_group_status() {
        assert_eq!(node_group_status(2, 0), CheckStatus::Insufficient);
        assert_eq!(node_group_status(3, 2), CheckStatus::Insufficient);
        assert_eq!(node_group_status(1, 2), CheckStatus::Excessive);
        assert_eq!(node_group_status(2, 2), CheckStatus::Ok);
    }

    #[tokio::test]
    async fn test_check_state() {
        let mut meta = MetaConfig {
            cluster_prefix: "test".into(),
            terra_node_group_specs: vec![
                TerraNodeGroupSpec {
                    name: "front".into(),
                    replicas: 2,
                    ..Default::default()
                },
                TerraNodeGroupSpec {
                    name: "new".into(),
                    replicas: 1,
                    ..Default::default()
                },
                TerraNodeGroupSpec {
                    name: "idle".into(),
                    replicas: 0,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        meta.master_node_group_spec.replicas = 1;

        let mut store = MockStateStore::new();
        store.expect_get_cluster_state().returning(|| Ok(b"infra".to_vec()));
        store.expect_get_nodes_state().returning(|| {
            Ok(NodesState::from([
                ("master".to_string(), group(&["test-master-0"])),
                ("front".to_string(), group(&["test-front-0", "test-front-1"])),
                ("old".to_string(), group(&["test-old-0"])),
            ]))
        });

        let mut api = MockNodeGroups::new();
        api.expect_get_cloud_config().returning(|_| Ok("cc".into()));

        let mut checker = MockInfraChecker::new();
        checker.expect_check_cluster().returning(|_| Ok(false));
        checker
            .expect_check_node()
            .returning(|group, index, _, _, _| match (group, index) {
                ("front", 1) => Ok(true),
                ("old", _) => Err(Error::pipeline_failed("static-node", "terraform plan", "boom")),
                _ => Ok(false),
            });

        let stats = check_state(&meta, &store, &api, &checker).await.unwrap();
        assert_eq!(stats.cluster.status, CheckStatus::Ok);

        let groups: BTreeMap<&str, CheckStatus> = stats
            .node_groups
            .iter()
            .map(|g| (g.name.as_str(), g.status))
            .collect();
        assert_eq!(groups["master"], CheckStatus::Ok);
        assert_eq!(groups["front"], CheckStatus::Ok);
        assert_eq!(groups["new"], CheckStatus::Insufficient);
        assert_eq!(groups["idle"], CheckStatus::Insufficient);
        assert_eq!(groups["old"], CheckStatus::Excessive);

        let nodes: BTreeMap<&str, CheckStatus> =
            stats.nodes.iter().map(|n| (n.name.as_str(), n.status)).collect();
        assert_eq!(nodes["test-master-0"], CheckStatus::Ok);
        assert_eq!(nodes["test-front-1"], CheckStatus::Changed);
        assert_eq!(nodes["test-old-0"], CheckStatus::Error);
    }

    #[test]
    fn test_render_formats() {
        let stats = Statistics {
            cluster: ClusterCheckResult {
                status: CheckStatus::Changed,
            },
            node_groups: vec![],
            nodes: vec![NodeCheckResult {
                group: "ng".into(),
                name: "n0".into(),
                status: CheckStatus::Ok,
            }],
        };
        let yaml = stats.render(OutputFormat::Yaml).unwrap();
        assert!(yaml.contains("status: changed"));
        let json: serde_json::Value =
            serde_json::from_str(&stats.render(OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(json["nodes"][0]["status"], "ok");
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
