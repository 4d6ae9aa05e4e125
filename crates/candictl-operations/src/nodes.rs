//! [`NodeOperator`] running the IaC tool against the cluster state store

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use candictl_common::{Error, Result, MASTER_NODE_GROUP};
use candictl_config::naming::node_name;
use candictl_config::MetaConfig;
use candictl_kube::{ClusterStateStore, NodeStateSaver};
use candictl_terraform::{
    apply_pipeline, destroy_pipeline, NodeRunnerSpec, OutputsExtractor, RunnerFactory,
    RunnerOptions,
};

use crate::converge::NodeOperator;

/// Orders, updates and destroys nodes, keeping their state in the cluster
pub struct TerraformNodeOperator {
    meta: Arc<MetaConfig>,
    factory: RunnerFactory,
    store: Arc<dyn ClusterStateStore>,
    auto_approve: bool,
}

impl TerraformNodeOperator {
    /// Operator for the cluster described by `meta`
    pub fn new(meta: Arc<MetaConfig>, factory: RunnerFactory, store: Arc<dyn ClusterStateStore>) -> Self {
        Self {
            meta,
            factory,
            store,
            auto_approve: false,
        }
    }

    /// Apply without asking
    pub fn with_auto_approve(mut self, flag: bool) -> Self {
        self.auto_approve = flag;
        self
    }

    fn group_settings(&self, group: &str) -> Result<Vec<u8>> {
        if group == MASTER_NODE_GROUP {
            return Ok(Vec::new());
        }
        let settings = self.meta.find_terra_node_group(group).ok_or_else(|| {
            Error::config_invalid(format!("node group {:?} is not declared", group))
        })?;
        Ok(serde_json::to_vec(&settings)?)
    }

    /// New nodes are applied without asking; plans of existing nodes follow
    /// the operator's flag.
    fn apply_options(&self, name: &str, group: &str, settings: &[u8], state: Option<&[u8]>) -> RunnerOptions {
        let opts = RunnerOptions::default()
            .auto_approve(state.is_none() || self.auto_approve)
            .with_saver(Arc::new(NodeStateSaver::new(
                self.store.clone(),
                name,
                group,
                settings.to_vec(),
            )));
        match state {
            Some(state) => opts.with_state(state),
            None => opts,
        }
    }

    /// Surplus nodes are destroyed without asking
    fn destroy_options(&self, state: &[u8]) -> RunnerOptions {
        RunnerOptions::default().with_state(state).auto_approve(true)
    }

    async fn apply_node(
        &self,
        group: &str,
        index: u32,
        cloud_config: &str,
        state: Option<&[u8]>,
    ) -> Result<String> {
        let name = node_name(&self.meta.cluster_prefix, group, index);
        let settings = self.group_settings(group)?;
        let opts = self.apply_options(&name, group, &settings, state);

        let spec = NodeRunnerSpec::new(group, index, cloud_config);
        let mut runner = self.factory.node(&self.meta, &spec, opts)?;

        if group == MASTER_NODE_GROUP {
            let outputs = apply_pipeline(&mut runner, &name, &OutputsExtractor::MasterNode).await?;
            self.store.save_master_node_state(&name, &outputs).await?;
        } else {
            let outputs = apply_pipeline(&mut runner, &name, &OutputsExtractor::OnlyState).await?;
            self.store
                .save_node_state(&name, group, &outputs.terraform_state, &settings)
                .await?;
        }
        Ok(name)
    }
}

#[async_trait]
impl NodeOperator for TerraformNodeOperator {
    async fn create_node(&self, group: &str, index: u32, cloud_config: &str) -> Result<String> {
        let name = self.apply_node(group, index, cloud_config, None).await?;
        info!(node = %name, "Node created");
        Ok(name)
    }

    async fn update_node(
        &self,
        group: &str,
        node: &str,
        index: u32,
        state: &[u8],
        cloud_config: &str,
    ) -> Result<()> {
        self.apply_node(group, index, cloud_config, Some(state)).await?;
        info!(node = %node, "Node updated");
        Ok(())
    }

    async fn destroy_node(
        &self,
        group: &str,
        node: &str,
        index: u32,
        state: &[u8],
        settings: &[u8],
    ) -> Result<()> {
        let opts = self.destroy_options(state);
        let spec = NodeRunnerSpec::new(group, index, "");
        let mut runner = self.factory.node_destroy(&self.meta, &spec, settings, opts)?;
        destroy_pipeline(&mut runner, node).await?;
        self.store.delete_node_state(node).await?;
        info!(node = %node, "Node destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStateStore;
    use candictl_common::cache::Cache;
    use candictl_common::input::StaticPrompter;
    use candictl_common::teardown::Teardown;
    use candictl_terraform::RunnerSettings;

    fn operator(dir: &std::path::Path, auto_approve: bool) -> TerraformNodeOperator {
        let factory = RunnerFactory::new(
            Arc::new(RunnerSettings {
                tmp_dir: dir.join("tmp"),
                ..Default::default()
            }),
            Arc::new(Cache::open_dir(dir.join("cache")).unwrap()),
            Arc::new(StaticPrompter(false)),
            Teardown::new(),
        );
        TerraformNodeOperator::new(
            Arc::new(MetaConfig::default()),
            factory,
            Arc::new(MockStateStore::new()),
        )
        .with_auto_approve(auto_approve)
    }

    #[test]
    fn test_new_and_surplus_nodes_never_ask() {
        let dir = tempfile::tempdir().unwrap();
        let op = operator(dir.path(), false);

        let create = op.apply_options("test-ng-1", "ng", b"{}", None);
        assert!(create.auto_approve);
        assert!(create.state.is_none());
        assert!(create.saver.is_some());

        let destroy = op.destroy_options(b"state");
        assert!(destroy.auto_approve);
        assert_eq!(destroy.state.as_deref(), Some(&b"state"[..]));
    }

    #[test]
    fn test_update_follows_flag() {
        let dir = tempfile::tempdir().unwrap();
        let update = operator(dir.path(), false).apply_options("test-ng-0", "ng", b"{}", Some(b"s"));
        assert!(!update.auto_approve);
        assert_eq!(update.state.as_deref(), Some(&b"s"[..]));

        let approved = operator(dir.path(), true).apply_options("test-ng-0", "ng", b"{}", Some(b"s"));
        assert!(approved.auto_approve);
    }
}
