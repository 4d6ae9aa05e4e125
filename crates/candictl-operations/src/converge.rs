//! Converge: reconcile declared node groups with the IaC state in the cluster
//!
//! Within a group nodes are created first, then every existing node is
//! updated, then surplus nodes are destroyed highest index first. Update and
//! destroy failures are collected so one broken node does not stop the group.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{error, info, info_span, warn, Instrument};

use candictl_common::input::Prompter;
use candictl_common::{Error, MultiError, Result, MASTER_NODE_GROUP};
use candictl_config::naming::{node_index, node_name, sort_by_index_desc};
use candictl_config::{MetaConfig, SchemaStore};
use candictl_kube::{ClusterStateSaver, ClusterStateStore, NodeGroupApi, NodeGroupTerraformState, NodesState};
use candictl_terraform::{apply_pipeline, step_for_group, OutputsExtractor, RunnerFactory, RunnerOptions};

const CREATE_FROM_SCRATCH: &str =
    "Cluster has no nodes created by Terraform. Do you want to continue and create nodes?";

/// IaC side effects on single nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeOperator: Send + Sync {
    /// Create node `index` of `group`, persist its state and return its name
    async fn create_node(&self, group: &str, index: u32, cloud_config: &str) -> Result<String>;

    /// Apply the current configuration to an existing node and persist its state
    async fn update_node(
        &self,
        group: &str,
        node: &str,
        index: u32,
        state: &[u8],
        cloud_config: &str,
    ) -> Result<()>;

    /// Destroy a node and drop its state
    async fn destroy_node(
        &self,
        group: &str,
        node: &str,
        index: u32,
        state: &[u8],
        settings: &[u8],
    ) -> Result<()>;
}

/// Input of one group reconciliation
#[derive(Debug, Clone, Default)]
pub struct NodeGroupOptions {
    /// Group name
    pub name: String,
    /// IaC step of the group
    pub step: String,
    /// Declared replicas
    pub replicas: u32,
    /// Base64 bootstrap cloud-config of the group
    pub cloud_config: String,
    /// Node states found in the cluster
    pub state: NodeGroupTerraformState,
}

/// Order groups for processing: master, then declared order, then the rest
/// alphabetically.
pub fn sort_node_groups<'a>(
    declared: &[String],
    present: impl IntoIterator<Item = &'a String>,
) -> Vec<String> {
    let present: BTreeSet<&String> = present.into_iter().collect();
    let mut out = Vec::with_capacity(present.len());

    let master = MASTER_NODE_GROUP.to_string();
    if present.contains(&master) {
        out.push(master.clone());
    }
    for name in declared {
        if *name != master && present.contains(name) && !out.contains(name) {
            out.push(name.clone());
        }
    }
    for name in present {
        if !out.contains(name) {
            out.push(name.clone());
        }
    }
    out
}

/// Delta planner for one node group
pub struct NodeGroupController {
    prefix: String,
    operator: Arc<dyn NodeOperator>,
    node_groups: Arc<dyn NodeGroupApi>,
}

impl NodeGroupController {
    /// Controller naming nodes `<prefix>-<group>-<index>`
    pub fn new(
        prefix: impl Into<String>,
        operator: Arc<dyn NodeOperator>,
        node_groups: Arc<dyn NodeGroupApi>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            operator,
            node_groups,
        }
    }

    /// Bring the group to its declared size and configuration
    pub async fn run(&self, opts: &NodeGroupOptions) -> Result<()> {
        let declared = opts.replicas as usize;
        let actual = opts.state.state.len();
        let mut errors = MultiError::new();

        info!(
            group = %opts.name,
            declared,
            actual,
            "[Converge] Node group {}",
            opts.name
        );

        if declared > actual {
            self.add_nodes(opts, declared - actual).await?;
        }
        if declared > 0 {
            self.update_nodes(opts, &mut errors).await;
        }
        if declared < actual {
            self.delete_nodes(opts, actual - declared, &mut errors).await;
        }
        errors.into_result()
    }

    async fn add_nodes(&self, opts: &NodeGroupOptions, count: usize) -> Result<()> {
        let mut created = Vec::with_capacity(count);
        let mut index = 0u32;
        while created.len() < count {
            let candidate = node_name(&self.prefix, &opts.name, index);
            if opts.state.state.contains_key(&candidate) {
                index += 1;
                continue;
            }
            let name = self
                .operator
                .create_node(&opts.name, index, &opts.cloud_config)
                .instrument(info_span!("create_node", node = %candidate))
                .await?;
            created.push(name);
            index += 1;
        }
        self.node_groups.wait_for_nodes_list_ready(&created).await
    }

    async fn update_nodes(&self, opts: &NodeGroupOptions, errors: &mut MultiError) {
        let mut nodes: Vec<(u32, &String, &Vec<u8>)> = Vec::with_capacity(opts.state.state.len());
        for (name, state) in &opts.state.state {
            match node_index(name) {
                Some(index) => nodes.push((index, name, state)),
                None => warn!(node = %name, "Node name has no index suffix, skipping"),
            }
        }
        nodes.sort_by_key(|(index, _, _)| *index);

        for (index, name, state) in nodes {
            let updated = self
                .operator
                .update_node(&opts.name, name, index, state, &opts.cloud_config)
                .instrument(info_span!("update_node", node = %name))
                .await;
            let result = match updated {
                Ok(()) => self.node_groups.wait_for_single_node_ready(name).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(node = %name, error = %e, "Node update failed");
                errors.push(e);
            }
        }
    }

    async fn delete_nodes(&self, opts: &NodeGroupOptions, count: usize, errors: &mut MultiError) {
        // Unindexed names count toward the surplus but are never destroyed.
        let mut names: Vec<String> = opts.state.state.keys().cloned().collect();
        sort_by_index_desc(&mut names);

        for name in names.into_iter().take(count) {
            let Some(index) = node_index(&name) else {
                warn!(node = %name, "Node name has no index suffix, skipping");
                continue;
            };
            let state = opts.state.state.get(&name).map(Vec::as_slice).unwrap_or_default();
            let result = self
                .operator
                .destroy_node(&opts.name, &name, index, state, &opts.state.settings)
                .instrument(info_span!("destroy_node", node = %name))
                .await;
            if let Err(e) = result {
                error!(node = %name, error = %e, "Node destroy failed");
                errors.push(e);
            }
        }
    }
}

/// Full converge of a running cluster
pub struct Converger {
    meta: Arc<MetaConfig>,
    factory: RunnerFactory,
    store: Arc<dyn ClusterStateStore>,
    node_groups: Arc<dyn NodeGroupApi>,
    operator: Arc<dyn NodeOperator>,
    prompter: Arc<dyn Prompter>,
    schema_store: Option<Arc<SchemaStore>>,
    auto_approve: bool,
}

impl Converger {
    /// Converger for `meta` read from the cluster
    pub fn new(
        meta: Arc<MetaConfig>,
        factory: RunnerFactory,
        store: Arc<dyn ClusterStateStore>,
        node_groups: Arc<dyn NodeGroupApi>,
        operator: Arc<dyn NodeOperator>,
        prompter: Arc<dyn Prompter>,
    ) -> Self {
        Self {
            meta,
            factory,
            store,
            node_groups,
            operator,
            prompter,
            schema_store: None,
            auto_approve: false,
        }
    }

    /// Validate discovery data against `store`
    pub fn with_schema_store(mut self, store: Arc<SchemaStore>) -> Self {
        self.schema_store = Some(store);
        self
    }

    /// Apply without asking
    pub fn with_auto_approve(mut self, flag: bool) -> Self {
        self.auto_approve = flag;
        self
    }

    /// Run every converge phase
    pub async fn run(&self) -> Result<()> {
        self.update_cluster_state()
            .instrument(info_span!("converge", phase = "Update Kubernetes cluster state"))
            .await?;

        let nodes_state = self.store.get_nodes_state().await?;
        if nodes_state.is_empty() && !self.prompter.confirm(CREATE_FROM_SCRATCH, false) {
            info!("[Converge] Nodes creation declined");
            return Ok(());
        }

        self.create_new_node_groups(&nodes_state)
            .instrument(info_span!("converge", phase = "Create NodeGroups"))
            .await?;

        let controller = NodeGroupController::new(
            &self.meta.cluster_prefix,
            self.operator.clone(),
            self.node_groups.clone(),
        );
        let declared: Vec<String> = self
            .meta
            .terra_node_group_specs
            .iter()
            .map(|ng| ng.name.clone())
            .collect();

        for group in sort_node_groups(&declared, nodes_state.keys()) {
            let state = nodes_state.get(&group).cloned().unwrap_or_default();
            let opts = self.group_options(&group, state).await?;
            controller
                .run(&opts)
                .instrument(info_span!("converge", group = %group))
                .await?;
        }

        info!("[Converge] Done");
        Ok(())
    }

    async fn update_cluster_state(&self) -> Result<()> {
        let state = self.store.get_cluster_state().await?;
        if state.is_empty() {
            return Err(Error::state_missing("Kubernetes cluster has no Terraform state"));
        }

        let opts = RunnerOptions::default()
            .with_state(state)
            .auto_approve(self.auto_approve)
            .with_saver(Arc::new(ClusterStateSaver::new(self.store.clone())));
        let mut runner = self.factory.base_infra(&self.meta, opts)?;
        let extractor = OutputsExtractor::BaseInfra {
            schema_store: self.schema_store.clone(),
        };
        let outputs = apply_pipeline(&mut runner, "Kubernetes cluster", &extractor).await?;
        self.store.save_cluster_state(&outputs).await
    }

    async fn create_new_node_groups(&self, nodes_state: &NodesState) -> Result<()> {
        for spec in &self.meta.terra_node_group_specs {
            if nodes_state.contains_key(&spec.name) {
                continue;
            }
            info!("[Converge] Create NodeGroup {:?}", spec.name);
            self.node_groups
                .create_node_group(&spec.name, &self.meta.node_group_manifest(spec))
                .await?;
            if spec.replicas == 0 {
                continue;
            }

            let cloud_config = self.node_groups.get_cloud_config(&spec.name).await?;
            let mut created = Vec::with_capacity(spec.replicas as usize);
            for index in 0..spec.replicas {
                created.push(
                    self.operator
                        .create_node(&spec.name, index, &cloud_config)
                        .await?,
                );
            }
            self.node_groups
                .wait_for_node_groups_ready(&BTreeMap::from([(spec.name.clone(), spec.replicas)]))
                .await?;
            info!(nodes = ?created, "[Converge] NodeGroup {:?} is ready", spec.name);
        }
        Ok(())
    }

    async fn group_options(&self, group: &str, state: NodeGroupTerraformState) -> Result<NodeGroupOptions> {
        let declared = self.meta.declared_replicas(group);
        let cloud_config = match declared {
            Some(_) => self.node_groups.get_cloud_config(group).await?,
            None => {
                warn!(group = %group, "Node group is not declared, its nodes will be destroyed");
                String::new()
            }
        };
        Ok(NodeGroupOptions {
            name: group.to_string(),
            step: step_for_group(group).to_string(),
            replicas: declared.unwrap_or(0),
            cloud_config,
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockNodeGroups as MockNodeGroupApi;
    use parking_lot::Mutex;

    fn state(names: &[&str]) -> NodeGroupTerraformState {
        NodeGroupTerraformState {
            state: names
                .iter()
                .map(|n| (n.to_string(), format!("state-{}", n).into_bytes()))
                .collect(),
            settings: b"{\"name\":\"ng\"}".to_vec(),
        }
    }

    fn options(replicas: u32, names: &[&str]) -> NodeGroupOptions {
        NodeGroupOptions {
            name: "ng".into(),
            step: "static-node".into(),
            replicas,
            cloud_config: "Y2xvdWQ=".into(),
            state: state(names),
        }
    }

    fn ready_nodes() -> MockNodeGroupApi {
        let mut api = MockNodeGroupApi::new();
        api.expect_wait_for_nodes_list_ready().returning(|_| Ok(()));
        api.expect_wait_for_single_node_ready().returning(|_| Ok(()));
        api
    }

    fn recording_operator(calls: Arc<Mutex<Vec<String>>>) -> MockNodeOperator {
        let mut op = MockNodeOperator::new();
        let c = calls.clone();
        op.expect_create_node().returning(move |group, index, _| {
            let name = format!("test-{}-{}", group, index);
            c.lock().push(format!("create {}", name));
            Ok(name)
        });
        let c = calls.clone();
        op.expect_update_node().returning(move |_, node, _, _, _| {
            c.lock().push(format!("update {}", node));
            Ok(())
        });
        let c = calls;
        op.expect_destroy_node().returning(move |_, node, _, _, _| {
            c.lock().push(format!("destroy {}", node));
            Ok(())
        });
        op
    }

    #[tokio::test]
    async fn test_shrink_updates_then_deletes_highest_index() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let controller = NodeGroupController::new(
            "test",
            Arc::new(recording_operator(calls.clone())),
            Arc::new(ready_nodes()),
        );

        controller
            .run(&options(2, &["test-ng-0", "test-ng-1", "test-ng-2"]))
            .await
            .unwrap();

        assert_eq!(
            *calls.lock(),
            vec![
                "update test-ng-0",
                "update test-ng-1",
                "update test-ng-2",
                "destroy test-ng-2",
            ]
        );
    }

    #[tokio::test]
    async fn test_grow_creates_missing_then_updates() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut api = MockNodeGroupApi::new();
        api.expect_wait_for_nodes_list_ready()
            .withf(|nodes| nodes == ["test-ng-1", "test-ng-2", "test-ng-3"])
            .times(1)
            .returning(|_| Ok(()));
        api.expect_wait_for_single_node_ready()
            .times(1)
            .returning(|_| Ok(()));

        let controller =
            NodeGroupController::new("test", Arc::new(recording_operator(calls.clone())), Arc::new(api));
        controller.run(&options(4, &["test-ng-0"])).await.unwrap();

        assert_eq!(
            *calls.lock(),
            vec![
                "create test-ng-1",
                "create test-ng-2",
                "create test-ng-3",
                "update test-ng-0",
            ]
        );
    }

    #[tokio::test]
    async fn test_create_fills_gaps() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let controller = NodeGroupController::new(
            "test",
            Arc::new(recording_operator(calls.clone())),
            Arc::new(ready_nodes()),
        );
        controller
            .run(&options(3, &["test-ng-0", "test-ng-2"]))
            .await
            .unwrap();
        assert_eq!(calls.lock()[0], "create test-ng-1");
    }

    #[tokio::test]
    async fn test_delete_order_is_numeric() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let names: Vec<String> = (0..=10).map(|i| format!("ng-{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();

        let controller = NodeGroupController::new(
            "test",
            Arc::new(recording_operator(calls.clone())),
            Arc::new(ready_nodes()),
        );
        controller.run(&options(1, &refs)).await.unwrap();

        let destroyed: Vec<String> = calls
            .lock()
            .iter()
            .filter_map(|c| c.strip_prefix("destroy ").map(str::to_string))
            .collect();
        let expected: Vec<String> = (1..=10).rev().map(|i| format!("ng-{}", i)).collect();
        assert_eq!(destroyed, expected);
    }

    #[tokio::test]
    async fn test_update_errors_are_collected() {
        let mut op = MockNodeOperator::new();
        op.expect_update_node().times(3).returning(|_, node, _, _, _| {
            if node == "test-ng-1" {
                Ok(())
            } else {
                Err(Error::pipeline_failed(node, "terraform apply", "boom"))
            }
        });

        let controller = NodeGroupController::new("test", Arc::new(op), Arc::new(ready_nodes()));
        let err = controller
            .run(&options(3, &["test-ng-0", "test-ng-1", "test-ng-2"]))
            .await
            .unwrap_err();
        match err {
            Error::Multi(multi) => assert_eq!(multi.len(), 2),
            other => panic!("expected multi error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_replicas_destroys_everything_without_updates() {
        let mut op = MockNodeOperator::new();
        op.expect_update_node().never();
        op.expect_destroy_node()
            .withf(|_, _, _, _, settings| settings == b"{\"name\":\"ng\"}")
            .times(2)
            .returning(|_, _, _, _, _| Ok(()));

        let controller = NodeGroupController::new("test", Arc::new(op), Arc::new(MockNodeGroupApi::new()));
        controller
            .run(&options(0, &["test-ng-0", "test-ng-1"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_node_without_index_is_skipped() {
        let mut op = MockNodeOperator::new();
        op.expect_update_node()
            .withf(|_, node, _, _, _| node == "test-ng-0")
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));

        let controller = NodeGroupController::new("test", Arc::new(op), Arc::new(ready_nodes()));
        controller
            .run(&options(2, &["test-ng-0", "test-ng-broken"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unindexed_node_counts_toward_surplus() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let controller = NodeGroupController::new(
            "test",
            Arc::new(recording_operator(calls.clone())),
            Arc::new(ready_nodes()),
        );
        controller
            .run(&options(1, &["test-ng-0", "test-ng-1", "test-ng-broken"]))
            .await
            .unwrap();

        let destroyed: Vec<String> = calls
            .lock()
            .iter()
            .filter_map(|c| c.strip_prefix("destroy ").map(str::to_string))
            .collect();
        assert_eq!(destroyed, vec!["test-ng-1"]);
    }

    #[tokio::test]
    async fn test_cluster_without_state_is_rejected() {
        use crate::testing::MockStateStore;
        use candictl_common::cache::Cache;
        use candictl_common::input::StaticPrompter;
        use candictl_common::teardown::Teardown;
        use candictl_config::ClusterType;
        use candictl_terraform::RunnerSettings;

        let dir = tempfile::tempdir().unwrap();
        let factory = RunnerFactory::new(
            Arc::new(RunnerSettings {
                tmp_dir: dir.path().join("tmp"),
                ..Default::default()
            }),
            Arc::new(Cache::open_dir(dir.path().join("cache")).unwrap()),
            Arc::new(StaticPrompter(true)),
            Teardown::new(),
        );
        let mut store = MockStateStore::new();
        store.expect_get_cluster_state().times(1).returning(|| Ok(Vec::new()));
        store.expect_get_nodes_state().never();

        let meta = MetaConfig {
            cluster_type: Some(ClusterType::Static),
            cluster_prefix: "test".to_string(),
            ..Default::default()
        };
        let converger = Converger::new(
            Arc::new(meta),
            factory,
            Arc::new(store),
            Arc::new(MockNodeGroupApi::new()),
            Arc::new(MockNodeOperator::new()),
            Arc::new(StaticPrompter(true)),
        );

        let err = converger.run().await.unwrap_err();
        assert!(matches!(err, Error::StateMissing { .. }));
    }

    #[test]
    fn test_sort_node_groups() {
        let declared = vec!["front".to_string(), "system".to_string()];
        let present = vec![
            "zeta".to_string(),
            "system".to_string(),
            "alpha".to_string(),
            "master".to_string(),
            "front".to_string(),
        ];
        assert_eq!(
            sort_node_groups(&declared, present.iter()),
            vec!["master", "front", "system", "alpha", "zeta"]
        );
    }
}
