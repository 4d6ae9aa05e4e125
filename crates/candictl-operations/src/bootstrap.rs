//! First-time provisioning of a cluster
//!
//! Every phase can also run on its own; phases share the state cache of the
//! cluster, so outputs of the infrastructure phase are kept there until the
//! bootstrap finishes and the cache is marked as exhausted.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use candictl_common::cache::Cache;
use candictl_common::teardown::Teardown;
use candictl_common::{Error, Result, MASTER_NODE_GROUP};
use candictl_config::naming::node_name;
use candictl_config::{MetaConfig, Resource, SchemaStore};
use candictl_kube::install::{wait_for_kubernetes_api, MasterNodeState};
use candictl_kube::{
    create_resources, install_deckhouse, prepare_install_config, CreateResourcesOptions,
    InstallConfig, KubeNodeGroups, KubeResourceApplier, KubeStateStore, NodeGroupApi,
};
use candictl_ssh::SshClient;
use candictl_terraform::{apply_pipeline, NodeRunnerSpec, OutputsExtractor, RunnerFactory, RunnerOptions};

use crate::bashible::{self, DEFAULT_BASHIBLE_DIR};
use crate::converge::NodeOperator;
use crate::nodes::TerraformNodeOperator;
use crate::session::{KubeAccess, KubeSession};

/// Cache key of the cluster UUID
pub const UUID_CACHE_KEY: &str = "uuid";
/// Cache key of the infrastructure outputs
pub const OUTPUTS_CACHE_KEY: &str = "base-infrastructure-outputs";

const NEXT_RUN_WARNING: &str = "State cache is exhausted. \
     The next bootstrap run with the same configuration will build a new cluster";

/// Outputs of the infrastructure phase kept between phases
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapOutputs {
    /// Base infrastructure state
    pub terraform_state: Vec<u8>,
    /// Provider discovery data
    pub cloud_discovery: Vec<u8>,
    /// Address of the first master reachable over SSH
    pub master_ip: String,
    /// Internal address of the first master
    pub master_internal_ip: String,
    /// States and data devices of the masters ordered so far
    pub masters: BTreeMap<String, MasterOutputs>,
}

/// Outputs of one master
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterOutputs {
    /// IaC state
    pub state: Vec<u8>,
    /// Kubernetes data device
    pub data_device_path: String,
}

/// Load the cluster UUID from the cache or generate and store a new one
pub fn ensure_uuid(cache: &Cache) -> Result<String> {
    if cache.in_cache(UUID_CACHE_KEY) {
        let raw = cache.load(UUID_CACHE_KEY)?;
        let uuid = String::from_utf8(raw)
            .map_err(|e| Error::cache_corrupt(UUID_CACHE_KEY, e.to_string()))?;
        let uuid = uuid.trim().to_string();
        Uuid::parse_str(&uuid).map_err(|e| Error::cache_corrupt(UUID_CACHE_KEY, e.to_string()))?;
        info!(uuid = %uuid, "Cluster UUID loaded from cache");
        return Ok(uuid);
    }
    let uuid = Uuid::new_v4().to_string();
    cache.save(UUID_CACHE_KEY, uuid.as_bytes())?;
    info!(uuid = %uuid, "Cluster UUID generated");
    Ok(uuid)
}

/// Install settings for `meta` enriched with the infrastructure outputs
pub fn install_config(meta: &MetaConfig, outputs: &BootstrapOutputs) -> Result<InstallConfig> {
    let mut cfg = prepare_install_config(meta)?;
    cfg.terraform_state = outputs.terraform_state.clone();
    cfg.cloud_discovery = outputs.cloud_discovery.clone();
    cfg.nodes_terraform_state = outputs
        .masters
        .iter()
        .map(|(name, m)| {
            (
                name.clone(),
                MasterNodeState {
                    state: m.state.clone(),
                    data_device_path: m.data_device_path.clone(),
                },
            )
        })
        .collect();
    Ok(cfg)
}

/// Create the NodeGroups and the nodes that follow the first master, then
/// wait for every group to become Ready.
pub async fn create_cluster_nodes(
    meta: &MetaConfig,
    node_groups: &dyn NodeGroupApi,
    operator: &dyn NodeOperator,
) -> Result<()> {
    let mut wait = BTreeMap::new();

    info!("[Nodes] Create NodeGroup \"master\"");
    node_groups
        .create_node_group(MASTER_NODE_GROUP, &meta.master_node_group_manifest())
        .await?;
    let masters = meta.master_node_group_spec.replicas;
    if meta.is_cloud() && masters > 1 {
        let cloud_config = node_groups.get_cloud_config(MASTER_NODE_GROUP).await?;
        for index in 1..masters {
            operator
                .create_node(MASTER_NODE_GROUP, index, &cloud_config)
                .instrument(info_span!("bootstrap", phase = "Create master", index))
                .await?;
        }
    }
    if masters > 0 {
        wait.insert(MASTER_NODE_GROUP.to_string(), masters);
    }

    for spec in &meta.terra_node_group_specs {
        info!("[Nodes] Create NodeGroup {:?}", spec.name);
        node_groups
            .create_node_group(&spec.name, &meta.node_group_manifest(spec))
            .await?;
        if spec.replicas == 0 {
            continue;
        }
        let cloud_config = node_groups.get_cloud_config(&spec.name).await?;
        for index in 0..spec.replicas {
            operator
                .create_node(&spec.name, index, &cloud_config)
                .instrument(info_span!("bootstrap", group = %spec.name, index))
                .await?;
        }
        wait.insert(spec.name.clone(), spec.replicas);
    }

    info!("[Nodes] Waiting for node groups to become Ready");
    node_groups.wait_for_node_groups_ready(&wait).await
}

/// Bootstrap inputs not carried by the configuration
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    /// Resources applied after the platform is installed
    pub resources: Vec<Resource>,
    /// Connect with this kubeconfig instead of the SSH kube proxy
    pub kubeconfig: Option<PathBuf>,
    /// Bashible bundle templates
    pub bashible_dir: PathBuf,
    /// Apply without asking
    pub auto_approve: bool,
    /// Resources creation loop settings
    pub resources_options: CreateResourcesOptions,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            resources: Vec::new(),
            kubeconfig: None,
            bashible_dir: PathBuf::from(DEFAULT_BASHIBLE_DIR),
            auto_approve: false,
            resources_options: CreateResourcesOptions::default(),
        }
    }
}

/// Drives the bootstrap phases
pub struct Bootstrapper {
    meta: Arc<MetaConfig>,
    ssh: SshClient,
    factory: RunnerFactory,
    teardown: Arc<Teardown>,
    schema_store: Option<Arc<SchemaStore>>,
    options: BootstrapOptions,
}

impl Bootstrapper {
    /// Bootstrapper for `meta`; the UUID is loaded from or stored in the cache
    pub fn new(
        mut meta: MetaConfig,
        ssh: SshClient,
        factory: RunnerFactory,
        teardown: Arc<Teardown>,
        options: BootstrapOptions,
    ) -> Result<Self> {
        meta.uuid = ensure_uuid(factory.cache())?;
        Ok(Self {
            meta: Arc::new(meta),
            ssh,
            factory,
            teardown,
            schema_store: None,
            options,
        })
    }

    /// Validate discovery data against `store`
    pub fn with_schema_store(mut self, store: Arc<SchemaStore>) -> Self {
        self.schema_store = Some(store);
        self
    }

    fn cache(&self) -> &Arc<Cache> {
        self.factory.cache()
    }

    fn load_outputs(&self) -> Result<BootstrapOutputs> {
        if self.cache().in_cache(OUTPUTS_CACHE_KEY) {
            self.cache().load_struct(OUTPUTS_CACHE_KEY)
        } else {
            Ok(BootstrapOutputs::default())
        }
    }

    fn access(&self) -> KubeAccess {
        match &self.options.kubeconfig {
            Some(path) => KubeAccess::Kubeconfig(path.clone()),
            None => KubeAccess::Ssh(self.ssh.clone()),
        }
    }

    /// Target the master ordered earlier, if any
    fn point_ssh_at_master(&self) -> Result<BootstrapOutputs> {
        let outputs = self.load_outputs()?;
        if !outputs.master_ip.is_empty() && self.ssh.settings().host != outputs.master_ip {
            self.ssh.set_host(&outputs.master_ip);
        }
        Ok(outputs)
    }

    fn require_cloud(&self, phase: &str) -> Result<()> {
        if self.meta.is_cloud() {
            Ok(())
        } else {
            Err(Error::config_invalid(format!("{} is only supported for Cloud clusters", phase)))
        }
    }

    /// Apply the base infrastructure and keep its outputs in the cache
    pub async fn base_infra(&self) -> Result<BootstrapOutputs> {
        self.require_cloud("base infrastructure")?;
        let opts = RunnerOptions::default().auto_approve(self.options.auto_approve);
        let mut runner = self.factory.base_infra(&self.meta, opts)?;
        let extractor = OutputsExtractor::BaseInfra {
            schema_store: self.schema_store.clone(),
        };
        let infra = apply_pipeline(&mut runner, "Kubernetes cluster", &extractor)
            .instrument(info_span!("bootstrap", phase = "Cloud infrastructure"))
            .await?;

        let mut outputs = self.load_outputs()?;
        outputs.terraform_state = infra.terraform_state;
        outputs.cloud_discovery = infra.cloud_discovery;
        self.cache().save_struct(OUTPUTS_CACHE_KEY, &outputs)?;
        Ok(outputs)
    }

    /// Order the first master and point SSH at it
    pub async fn create_first_master(&self, mut outputs: BootstrapOutputs) -> Result<BootstrapOutputs> {
        self.require_cloud("master node creation")?;
        let name = node_name(&self.meta.cluster_prefix, MASTER_NODE_GROUP, 0);
        let opts = RunnerOptions::default().auto_approve(self.options.auto_approve);
        let spec = NodeRunnerSpec::new(MASTER_NODE_GROUP, 0, "");
        let mut runner = self.factory.node(&self.meta, &spec, opts)?;
        let master = apply_pipeline(&mut runner, &name, &OutputsExtractor::MasterNode)
            .instrument(info_span!("bootstrap", phase = "Create first master"))
            .await?;

        outputs.master_ip = master.master_ip_for_ssh.clone();
        outputs.master_internal_ip = master.node_internal_ip.clone();
        outputs.masters.insert(
            name,
            MasterOutputs {
                state: master.terraform_state,
                data_device_path: master.kubernetes_data_device_path,
            },
        );
        self.cache().save_struct(OUTPUTS_CACHE_KEY, &outputs)?;
        self.ssh.set_host(&outputs.master_ip);
        Ok(outputs)
    }

    /// Run the bashible bundle on the first master
    pub async fn execute_bashible_bundle(&self) -> Result<()> {
        let outputs = self.point_ssh_at_master()?;
        info!("[Bashible] Waiting for SSH on {}", self.ssh.settings().host);
        self.ssh.check().await_availability().await?;

        let work_dir = self.factory.settings().tmp_dir.join("bashible-bundle");
        let node_ip = Some(outputs.master_internal_ip.as_str()).filter(|ip| !ip.is_empty());
        bashible::execute_bashible_bundle(
            &self.ssh,
            &self.meta,
            &self.options.bashible_dir,
            &work_dir,
            node_ip,
        )
        .instrument(info_span!("bootstrap", phase = "Execute bashible bundle"))
        .await
    }

    async fn install(&self, client: &Client) -> Result<()> {
        let cancel = self.teardown.cancellation_token();
        let cfg = install_config(&self.meta, &self.load_outputs()?)?;
        wait_for_kubernetes_api(client, &cancel).await?;
        install_deckhouse(client, &cfg, &cancel)
            .instrument(info_span!("bootstrap", phase = "Install Deckhouse"))
            .await
    }

    async fn create_nodes(&self, client: &Client) -> Result<()> {
        let cancel = self.teardown.cancellation_token();
        let node_groups = KubeNodeGroups::new(client.clone(), cancel.clone());
        let store = Arc::new(KubeStateStore::new(client.clone(), cancel));
        let operator = TerraformNodeOperator::new(self.meta.clone(), self.factory.clone(), store)
            .with_auto_approve(self.options.auto_approve);
        create_cluster_nodes(&self.meta, &node_groups, &operator)
            .instrument(info_span!("bootstrap", phase = "Create nodes"))
            .await
    }

    async fn apply_resources(&self, client: &Client) -> Result<()> {
        if self.options.resources.is_empty() {
            return Ok(());
        }
        let applier = KubeResourceApplier::new(client.clone());
        create_resources(
            &applier,
            &self.options.resources,
            &self.options.resources_options,
            &self.teardown.cancellation_token(),
        )
        .instrument(info_span!("bootstrap", phase = "Create resources"))
        .await
    }

    /// Install the platform into a running control plane
    pub async fn install_deckhouse(&self) -> Result<()> {
        self.point_ssh_at_master()?;
        let mut session = KubeSession::connect(&self.access()).await?;
        let result = self.install(&session.client()).await;
        session.stop().await;
        result
    }

    /// Apply the declarative resources
    pub async fn create_resources(&self) -> Result<()> {
        self.point_ssh_at_master()?;
        let mut session = KubeSession::connect(&self.access()).await?;
        let result = self.apply_resources(&session.client()).await;
        session.stop().await;
        result
    }

    /// Every phase in order
    pub async fn run(&self) -> Result<()> {
        if self.meta.is_cloud() {
            info!("[Phase 1] Create base infrastructure");
            let outputs = self.base_infra().await?;
            info!("[Phase 2] Create first master");
            self.create_first_master(outputs).await?;
        }

        info!("[Phase 3] Run bashible bundle");
        self.execute_bashible_bundle().await?;

        info!("[Phase 4] Install Deckhouse");
        let mut session = KubeSession::connect(&self.access()).await?;
        let client = session.client();
        let result = async {
            self.install(&client).await?;
            info!("[Phase 5] Create nodes");
            self.create_nodes(&client).await?;
            info!("[Phase 6] Create resources");
            self.apply_resources(&client).await
        }
        .await;
        session.stop().await;
        result?;

        self.cache().clean()?;
        warn!("{}", NEXT_RUN_WARNING);
        info!("[Bootstrap] Done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converge::MockNodeOperator;
    use crate::testing::MockNodeGroups;
    use candictl_config::{ClusterType, TerraNodeGroupSpec};
    use parking_lot::Mutex;

    #[test]
    fn test_uuid_persists_in_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open_dir(dir.path()).unwrap();
        let first = ensure_uuid(&cache).unwrap();
        assert!(Uuid::parse_str(&first).is_ok());
        assert_eq!(ensure_uuid(&cache).unwrap(), first);
    }

    #[test]
    fn test_corrupt_uuid_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open_dir(dir.path()).unwrap();
        cache.save(UUID_CACHE_KEY, b"not-a-uuid").unwrap();
        assert!(matches!(ensure_uuid(&cache), Err(Error::CacheCorrupt { .. })));
    }

    #[test]
    fn test_outputs_survive_cache_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = BootstrapOutputs {
            terraform_state: b"{\"version\":4}".to_vec(),
            master_ip: "1.2.3.4".into(),
            masters: BTreeMap::from([(
                "test-master-0".to_string(),
                MasterOutputs {
                    state: b"{}".to_vec(),
                    data_device_path: "/dev/vdb".into(),
                },
            )]),
            ..Default::default()
        };
        Cache::open_dir(dir.path())
            .unwrap()
            .save_struct(OUTPUTS_CACHE_KEY, &outputs)
            .unwrap();

        let reopened = Cache::open_dir(dir.path()).unwrap();
        let loaded: BootstrapOutputs = reopened.load_struct(OUTPUTS_CACHE_KEY).unwrap();
        assert_eq!(loaded, outputs);
    }

    fn cloud_meta() -> MetaConfig {
        let mut meta = MetaConfig {
            cluster_type: Some(ClusterType::Cloud),
            cluster_prefix: "test".into(),
            terra_node_group_specs: vec![
                TerraNodeGroupSpec {
                    name: "front".into(),
                    replicas: 2,
                    ..Default::default()
                },
                TerraNodeGroupSpec {
                    name: "spare".into(),
                    replicas: 0,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        meta.master_node_group_spec.replicas = 3;
        meta
    }

    #[tokio::test]
    async fn test_create_cluster_nodes() {
        let meta = cloud_meta();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let mut api = MockNodeGroups::new();
        let c = calls.clone();
        api.expect_create_node_group().times(3).returning(move |name, _| {
            c.lock().push(format!("nodegroup {}", name));
            Ok(())
        });
        api.expect_get_cloud_config()
            .times(2)
            .returning(|group| Ok(format!("cc-{}", group)));
        api.expect_wait_for_node_groups_ready()
            .withf(|groups| {
                groups == &BTreeMap::from([("front".to_string(), 2), ("master".to_string(), 3)])
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut op = MockNodeOperator::new();
        let c = calls.clone();
        op.expect_create_node().returning(move |group, index, cc| {
            c.lock().push(format!("node {}-{} {}", group, index, cc));
            Ok(format!("test-{}-{}", group, index))
        });

        create_cluster_nodes(&meta, &api, &op).await.unwrap();
        assert_eq!(
            *calls.lock(),
            vec![
                "nodegroup master",
                "node master-1 cc-master",
                "node master-2 cc-master",
                "nodegroup front",
                "node front-0 cc-front",
                "node front-1 cc-front",
                "nodegroup spare",
            ]
        );
    }

    #[tokio::test]
    async fn test_static_cluster_creates_no_extra_masters() {
        let mut meta = MetaConfig {
            cluster_type: Some(ClusterType::Static),
            cluster_prefix: "test".into(),
            ..Default::default()
        };
        meta.master_node_group_spec.replicas = 1;

        let mut api = MockNodeGroups::new();
        api.expect_create_node_group().times(1).returning(|_, _| Ok(()));
        api.expect_get_cloud_config().never();
        api.expect_wait_for_node_groups_ready().times(1).returning(|_| Ok(()));
        let mut op = MockNodeOperator::new();
        op.expect_create_node().never();

        create_cluster_nodes(&meta, &api, &op).await.unwrap();
    }

    #[test]
    fn test_install_config_carries_outputs() {
        let mut meta = cloud_meta();
        meta.deckhouse_config.images_repo = "registry.example.com/d8".into();
        meta.deckhouse_config.dev_branch = "main".into();
        meta.uuid = "6f1c0b9e-0000-4000-8000-000000000000".into();

        let outputs = BootstrapOutputs {
            terraform_state: b"infra".to_vec(),
            cloud_discovery: b"{}".to_vec(),
            masters: BTreeMap::from([(
                "test-master-0".to_string(),
                MasterOutputs {
                    state: b"master".to_vec(),
                    data_device_path: "/dev/vdb".into(),
                },
            )]),
            ..Default::default()
        };
        let cfg = install_config(&meta, &outputs).unwrap();
        assert_eq!(cfg.terraform_state, b"infra");
        assert_eq!(cfg.uuid, meta.uuid);
        assert_eq!(cfg.nodes_terraform_state["test-master-0"].data_device_path, "/dev/vdb");
    }
}
