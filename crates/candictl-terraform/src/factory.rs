//! Builds runners from the cluster configuration

use std::sync::Arc;

use candictl_common::cache::Cache;
use candictl_common::input::Prompter;
use candictl_common::teardown::Teardown;
use candictl_common::{Result, MASTER_NODE_GROUP};
use candictl_config::naming::node_name;
use candictl_config::MetaConfig;

use crate::runner::{Runner, RunnerSettings};
use crate::saver::{StateDestination, StateSaver};
use crate::{step_for_group, BASE_INFRA_STEP};

/// Per-runner choices of the calling operation
#[derive(Default, Clone)]
pub struct RunnerOptions {
    /// State to start from instead of the cache
    pub state: Option<Vec<u8>>,
    /// Apply and destroy without asking
    pub auto_approve: bool,
    /// Reuse cached state without asking
    pub allowed_cached_state: bool,
    /// Sink for intermediate states
    pub saver: Option<Arc<dyn StateDestination>>,
}

impl std::fmt::Debug for RunnerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerOptions")
            .field("state", &self.state.as_ref().map(Vec::len))
            .field("auto_approve", &self.auto_approve)
            .field("allowed_cached_state", &self.allowed_cached_state)
            .field("saver", &self.saver.is_some())
            .finish()
    }
}

impl RunnerOptions {
    /// Start from `state`
    pub fn with_state(mut self, state: impl Into<Vec<u8>>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Set auto-approve
    pub fn auto_approve(mut self, flag: bool) -> Self {
        self.auto_approve = flag;
        self
    }

    /// Allow cached state
    pub fn allowed_cached_state(mut self, flag: bool) -> Self {
        self.allowed_cached_state = flag;
        self
    }

    /// Stream intermediate states to `destination`
    pub fn with_saver(mut self, destination: Arc<dyn StateDestination>) -> Self {
        self.saver = Some(destination);
        self
    }
}

/// Identifies one node runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRunnerSpec {
    /// Node group name
    pub group: String,
    /// Index inside the group
    pub index: u32,
    /// Bootstrap cloud-config for the node, base64-encoded
    pub cloud_config: String,
}

impl NodeRunnerSpec {
    /// Spec for node `index` of `group`
    pub fn new(group: impl Into<String>, index: u32, cloud_config: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            index,
            cloud_config: cloud_config.into(),
        }
    }
}

/// Creates runners sharing settings, cache, prompter and teardown registry
#[derive(Clone)]
pub struct RunnerFactory {
    settings: Arc<RunnerSettings>,
    cache: Arc<Cache>,
    prompter: Arc<dyn Prompter>,
    teardown: Arc<Teardown>,
}

impl std::fmt::Debug for RunnerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerFactory")
            .field("settings", &self.settings)
            .field("cache", &self.cache.dir())
            .finish_non_exhaustive()
    }
}

impl RunnerFactory {
    /// New factory
    pub fn new(
        settings: Arc<RunnerSettings>,
        cache: Arc<Cache>,
        prompter: Arc<dyn Prompter>,
        teardown: Arc<Teardown>,
    ) -> Self {
        Self {
            settings,
            cache,
            prompter,
            teardown,
        }
    }

    /// Same factory writing to another cache
    pub fn with_cache(&self, cache: Arc<Cache>) -> Self {
        Self {
            cache,
            ..self.clone()
        }
    }

    /// Shared settings
    pub fn settings(&self) -> &Arc<RunnerSettings> {
        &self.settings
    }

    /// Cache used by new runners
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Runner for the base infrastructure
    pub fn base_infra(&self, meta: &MetaConfig, opts: RunnerOptions) -> Result<Runner> {
        let runner = self
            .runner(meta, BASE_INFRA_STEP)
            .with_name(BASE_INFRA_STEP)
            .with_variables(&meta.marshal_config()?)?;
        self.finish(runner, opts)
    }

    /// Runner for one node
    pub fn node(
        &self,
        meta: &MetaConfig,
        spec: &NodeRunnerSpec,
        opts: RunnerOptions,
    ) -> Result<Runner> {
        let variables = meta.node_group_config(&spec.group, spec.index, &spec.cloud_config)?;
        let runner = self
            .runner(meta, step_for_group(&spec.group))
            .with_name(node_name(&meta.cluster_prefix, &spec.group, spec.index))
            .with_variables(&variables)?;
        self.finish(runner, opts)
    }

    /// Runner destroying one node with the group shape captured at creation
    pub fn node_destroy(
        &self,
        meta: &MetaConfig,
        spec: &NodeRunnerSpec,
        group_settings: &[u8],
        opts: RunnerOptions,
    ) -> Result<Runner> {
        if spec.group == MASTER_NODE_GROUP {
            return self.node(meta, spec, opts);
        }
        let scoped = meta.with_node_group_settings(group_settings)?;
        self.node(&scoped, spec, opts)
    }

    fn runner(&self, meta: &MetaConfig, step: &str) -> Runner {
        Runner::new(
            self.settings.clone(),
            self.cache.clone(),
            self.prompter.clone(),
            &meta.provider_name,
            &meta.cluster_prefix,
            &meta.layout,
            step,
        )
        .with_stop_token(&self.teardown.cancellation_token())
    }

    fn finish(&self, mut runner: Runner, opts: RunnerOptions) -> Result<Runner> {
        if let Some(state) = opts.state.as_deref() {
            runner = runner.with_state(state)?;
        }
        if let Some(destination) = opts.saver {
            runner = runner.with_intermediate_state_saver(StateSaver::new(destination));
        }
        runner = runner
            .with_auto_approve(opts.auto_approve)
            .with_allowed_cached_state(opts.allowed_cached_state);

        let handle = runner.handle();
        let hook = self
            .teardown
            .register_scoped(format!("terraform runner {}", runner.name()), move || {
                handle.stop()
            });
        Ok(runner.with_teardown_hook(hook))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candictl_common::input::StaticPrompter;
    use candictl_config::ClusterType;

    fn meta() -> MetaConfig {
        MetaConfig {
            cluster_type: Some(ClusterType::Cloud),
            layout: "standard".to_string(),
            provider_name: "openstack".to_string(),
            original_provider_name: "OpenStack".to_string(),
            cluster_prefix: "test".to_string(),
            ..Default::default()
        }
    }

    fn factory(dir: &std::path::Path) -> (RunnerFactory, Arc<Teardown>) {
        let teardown = Teardown::new();
        let settings = Arc::new(RunnerSettings {
            providers_dir: dir.join("providers"),
            tmp_dir: dir.join("tmp"),
            ..Default::default()
        });
        let cache = Arc::new(Cache::open_dir(dir.join("cache")).unwrap());
        (
            RunnerFactory::new(
                settings,
                cache,
                Arc::new(StaticPrompter(true)),
                teardown.clone(),
            ),
            teardown,
        )
    }

    #[test]
    fn test_node_runner_naming_and_step() {
        let dir = tempfile::tempdir().unwrap();
        let (factory, _) = factory(dir.path());
        let meta = meta();

        let master = factory
            .node(&meta, &NodeRunnerSpec::new("master", 0, ""), RunnerOptions::default())
            .unwrap();
        assert_eq!(master.name(), "test-master-0");
        assert_eq!(master.step(), "master-node");
        assert!(master
            .working_dir()
            .ends_with("openstack/layouts/standard/master-node"));

        let front = factory
            .node(&meta, &NodeRunnerSpec::new("front", 3, "Y2M="), RunnerOptions::default())
            .unwrap();
        assert_eq!(front.name(), "test-front-3");
        assert_eq!(front.step(), "static-node");
    }

    #[test]
    fn test_teardown_stops_runners() {
        let dir = tempfile::tempdir().unwrap();
        let (factory, teardown) = factory(dir.path());
        let runner = factory
            .base_infra(&meta(), RunnerOptions::default().auto_approve(true))
            .unwrap();
        assert_eq!(runner.name(), "base-infrastructure");
        assert_eq!(teardown.pending_hooks(), 1);

        teardown.shutdown();
        assert!(runner.handle().is_stopped());
    }

    #[test]
    fn test_dropped_runners_leave_no_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let (factory, teardown) = factory(dir.path());
        let meta = meta();

        for _ in 0..3 {
            let base = factory.base_infra(&meta, RunnerOptions::default()).unwrap();
            let node = factory
                .node(&meta, &NodeRunnerSpec::new("front", 0, ""), RunnerOptions::default())
                .unwrap();
            assert_eq!(teardown.pending_hooks(), 2);
            drop(base);
            drop(node);
        }
        assert_eq!(teardown.pending_hooks(), 0);
    }

    #[test]
    fn test_injected_state_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let (factory, _) = factory(dir.path());
        let runner = factory
            .node(
                &meta(),
                &NodeRunnerSpec::new("front", 0, ""),
                RunnerOptions::default().with_state(br#"{"resources":[{},{}]}"#.to_vec()),
            )
            .unwrap();
        assert_eq!(runner.resources_quantity_in_state(), 2);
    }
}
