//! Platform installation into a fresh cluster
//!
//! Manifests are created in a fixed order, each one create-or-update, then the
//! controller Deployment is created and waited on.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, Pod, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::{ListParams, LogParams, PostParams};
use kube::{Api, Client};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use candictl_common::kube_utils::{create_or_merge, is_already_exists};
use candictl_common::retry::{retry_loop, RetryConfig};
use candictl_common::{Error, Result, DECKHOUSE_NAMESPACE, KUBE_SYSTEM_NAMESPACE};
use candictl_config::meta::to_kebab;
use candictl_config::MetaConfig;

use crate::manifests::{
    admin_cluster_role, admin_cluster_role_binding, cluster_config_secret, cluster_state_secret,
    cluster_uuid_config_map, deckhouse_config_map, deckhouse_deployment, deckhouse_namespace,
    deckhouse_service_account, install_data_config_map, kube_dns_service,
    master_device_path_secret, node_state_secret, provider_config_secret, registry_secret,
    static_config_secret, DeploymentParams, DECKHOUSE_NAME,
};

/// Hard cap on waiting for the controller to become ready
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(11 * 60);

const LOG_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);
const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DNS_IP_ALLOCATED: &str = "provided IP is already allocated";

/// State of one master recorded during install
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasterNodeState {
    /// IaC state of the master
    pub state: Vec<u8>,
    /// Data device of the master
    pub data_device_path: String,
}

/// Everything the install writes into the cluster
#[derive(Debug, Clone, Default)]
pub struct InstallConfig {
    /// Controller image
    pub image: String,
    /// Base64-encoded docker config; empty when the registry is public
    pub registry_docker_cfg: String,
    /// Controller log level
    pub log_level: String,
    /// Module bundle
    pub bundle: String,
    /// Merged module configuration
    pub deckhouse_config: Value,
    /// `ClusterConfiguration` YAML
    pub cluster_config: Vec<u8>,
    /// Provider configuration YAML
    pub provider_cluster_config: Vec<u8>,
    /// `StaticClusterConfiguration` YAML
    pub static_cluster_config: Vec<u8>,
    /// Base infrastructure state
    pub terraform_state: Vec<u8>,
    /// Provider discovery data
    pub cloud_discovery: Vec<u8>,
    /// Masters ordered during bootstrap
    pub nodes_terraform_state: BTreeMap<String, MasterNodeState>,
    /// Cluster UUID
    pub uuid: String,
    /// Address pinned for `kube-dns`; empty to skip the Service
    pub kube_dns_address: String,
    /// Pin the controller to control-plane nodes
    pub master_node_selector: bool,
    /// Version recorded in `install-data`
    pub installer_version: String,
}

impl InstallConfig {
    /// Whether images are pulled with credentials
    pub fn is_secure_registry(&self) -> bool {
        !self.registry_docker_cfg.is_empty()
    }

    fn deployment_params(&self) -> DeploymentParams {
        DeploymentParams {
            image: self.image.clone(),
            log_level: self.log_level.clone(),
            bundle: self.bundle.clone(),
            secure_registry: self.is_secure_registry(),
            master_node_selector: self.master_node_selector,
        }
    }
}

/// `<repo>/dev:<branch>` for development builds, `<repo>:<channel>` otherwise
pub fn image_for(images_repo: &str, dev_branch: &str, release_channel: &str) -> Result<String> {
    let repo = images_repo.trim_end_matches('/');
    if !dev_branch.is_empty() {
        return Ok(format!("{}/dev:{}", repo, dev_branch));
    }
    if release_channel.is_empty() {
        return Err(Error::config_invalid_in(
            "InitConfiguration",
            "either deckhouse.devBranch or deckhouse.releaseChannel is required",
        ));
    }
    Ok(format!("{}:{}", repo, to_kebab(release_channel)))
}

/// Install settings derived from the configuration
pub fn prepare_install_config(meta: &MetaConfig) -> Result<InstallConfig> {
    let dc = &meta.deckhouse_config;
    Ok(InstallConfig {
        image: image_for(&dc.images_repo, &dc.dev_branch, &dc.release_channel)?,
        registry_docker_cfg: dc.registry_docker_cfg.clone(),
        log_level: dc.log_level.clone(),
        bundle: dc.bundle.clone(),
        deckhouse_config: meta.merge_deckhouse_config(&[])?,
        cluster_config: meta.cluster_config_yaml()?.into_bytes(),
        provider_cluster_config: meta.provider_cluster_config_yaml()?.into_bytes(),
        static_cluster_config: meta.static_cluster_config_yaml()?.into_bytes(),
        uuid: meta.uuid.clone(),
        kube_dns_address: meta.cluster_dns_address.clone(),
        installer_version: env!("CARGO_PKG_VERSION").to_string(),
        ..Default::default()
    })
}

/// An object created during install
#[derive(Debug, Clone)]
pub enum ManifestObject {
    /// Namespace
    Namespace(Namespace),
    /// ClusterRole
    ClusterRole(ClusterRole),
    /// ClusterRoleBinding
    ClusterRoleBinding(ClusterRoleBinding),
    /// ServiceAccount
    ServiceAccount(ServiceAccount),
    /// ConfigMap
    ConfigMap(ConfigMap),
    /// Secret
    Secret(Secret),
    /// Service
    Service(Service),
    /// Deployment
    Deployment(Deployment),
}

/// A named install step
#[derive(Debug, Clone)]
pub struct ManifestTask {
    /// Display name, e.g. `Secret "d8-cluster-configuration"`
    pub name: String,
    /// Object to create or update
    pub object: ManifestObject,
}

impl ManifestTask {
    fn new(kind: &str, name: &str, object: ManifestObject) -> Self {
        Self {
            name: format!("{} {:?}", kind, name),
            object,
        }
    }

    /// Create the object, updating it when it exists
    pub async fn create_or_update(&self, client: &Client) -> Result<()> {
        let ns = |ns: &Option<String>| ns.clone().unwrap_or_else(|| DECKHOUSE_NAMESPACE.to_string());
        match &self.object {
            ManifestObject::Namespace(o) => {
                create_or_merge(&Api::<Namespace>::all(client.clone()), o).await?
            }
            ManifestObject::ClusterRole(o) => {
                create_or_merge(&Api::<ClusterRole>::all(client.clone()), o).await?
            }
            ManifestObject::ClusterRoleBinding(o) => {
                create_or_merge(&Api::<ClusterRoleBinding>::all(client.clone()), o).await?
            }
            ManifestObject::ServiceAccount(o) => {
                let api = Api::<ServiceAccount>::namespaced(client.clone(), &ns(&o.metadata.namespace));
                create_or_merge(&api, o).await?
            }
            ManifestObject::ConfigMap(o) => {
                let api = Api::<ConfigMap>::namespaced(client.clone(), &ns(&o.metadata.namespace));
                create_or_merge(&api, o).await?
            }
            ManifestObject::Secret(o) => {
                let api = Api::<Secret>::namespaced(client.clone(), &ns(&o.metadata.namespace));
                create_or_merge(&api, o).await?
            }
            ManifestObject::Deployment(o) => {
                let api = Api::<Deployment>::namespaced(client.clone(), &ns(&o.metadata.namespace));
                create_or_merge(&api, o).await?
            }
            ManifestObject::Service(o) => {
                let api = Api::<Service>::namespaced(client.clone(), &ns(&o.metadata.namespace));
                match api.create(&PostParams::default(), o).await {
                    Ok(_) => {}
                    Err(e) if e.to_string().contains(DNS_IP_ALLOCATED) => {
                        info!("Service for DNS already exists, skipping");
                    }
                    Err(e) if is_already_exists(&e) => create_or_merge(&api, o).await?,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }
}

/// Install steps in creation order
pub fn install_tasks(cfg: &InstallConfig) -> Result<Vec<ManifestTask>> {
    use ManifestObject as O;

    let mut tasks = vec![
        ManifestTask::new(
            "Namespace",
            DECKHOUSE_NAMESPACE,
            O::Namespace(deckhouse_namespace(DECKHOUSE_NAMESPACE)),
        ),
        ManifestTask::new("Admin ClusterRole", "cluster-admin", O::ClusterRole(admin_cluster_role())),
        ManifestTask::new(
            "ClusterRoleBinding",
            DECKHOUSE_NAME,
            O::ClusterRoleBinding(admin_cluster_role_binding()),
        ),
        ManifestTask::new(
            "ServiceAccount",
            DECKHOUSE_NAME,
            O::ServiceAccount(deckhouse_service_account()),
        ),
        ManifestTask::new(
            "ConfigMap",
            DECKHOUSE_NAME,
            O::ConfigMap(deckhouse_config_map(&cfg.deckhouse_config)?),
        ),
        ManifestTask::new(
            "ConfigMap",
            "install-data",
            O::ConfigMap(install_data_config_map(&cfg.installer_version)),
        ),
    ];

    if cfg.is_secure_registry() {
        tasks.push(ManifestTask::new(
            "Secret",
            crate::manifests::REGISTRY_SECRET,
            O::Secret(registry_secret(&cfg.registry_docker_cfg)?),
        ));
    }

    if !cfg.terraform_state.is_empty() {
        tasks.push(ManifestTask::new(
            "Secret",
            crate::manifests::CLUSTER_STATE_SECRET,
            O::Secret(cluster_state_secret(&cfg.terraform_state)),
        ));
    }

    for (node, master) in &cfg.nodes_terraform_state {
        let secret = node_state_secret(node, candictl_common::MASTER_NODE_GROUP, &master.state, &[]);
        tasks.push(ManifestTask::new(
            "Secret",
            &crate::manifests::node_state_secret_name(node),
            O::Secret(secret),
        ));
        if !master.data_device_path.is_empty() {
            tasks.push(ManifestTask::new(
                "Secret",
                crate::manifests::MASTERS_DATA_DEVICE_SECRET,
                O::Secret(master_device_path_secret(node, &master.data_device_path)),
            ));
        }
    }

    tasks.push(ManifestTask::new(
        "Secret",
        crate::manifests::CLUSTER_CONFIG_SECRET,
        O::Secret(cluster_config_secret(&cfg.cluster_config)),
    ));

    if !cfg.provider_cluster_config.is_empty() {
        tasks.push(ManifestTask::new(
            "Secret",
            crate::manifests::PROVIDER_CONFIG_SECRET,
            O::Secret(provider_config_secret(
                &cfg.provider_cluster_config,
                &cfg.cloud_discovery,
            )),
        ));
    }

    if !cfg.static_cluster_config.is_empty() {
        tasks.push(ManifestTask::new(
            "Secret",
            crate::manifests::STATIC_CONFIG_SECRET,
            O::Secret(static_config_secret(&cfg.static_cluster_config)),
        ));
    }

    if !cfg.uuid.is_empty() {
        tasks.push(ManifestTask::new(
            "ConfigMap",
            crate::manifests::CLUSTER_UUID_CONFIG_MAP,
            O::ConfigMap(cluster_uuid_config_map(&cfg.uuid)),
        ));
    }

    if !cfg.kube_dns_address.is_empty() {
        tasks.push(ManifestTask::new(
            "Service",
            "kube-dns",
            O::Service(kube_dns_service(&cfg.kube_dns_address)),
        ));
    }

    Ok(tasks)
}

/// Deployment task of the controller
pub fn deployment_task(cfg: &InstallConfig) -> ManifestTask {
    ManifestTask::new(
        "Deployment",
        DECKHOUSE_NAME,
        ManifestObject::Deployment(deckhouse_deployment(&cfg.deployment_params())),
    )
}

async fn run_task(client: &Client, task: &ManifestTask, cancel: &CancellationToken) -> Result<()> {
    retry_loop(
        &RetryConfig::new(45, Duration::from_secs(5)),
        &task.name,
        cancel,
        || task.create_or_update(client),
    )
    .await?;
    info!("{} created", task.name);
    Ok(())
}

/// Create every install manifest except the Deployment
pub async fn create_deckhouse_manifests(
    client: &Client,
    cfg: &InstallConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    for task in install_tasks(cfg)? {
        run_task(client, &task, cancel).await?;
    }
    Ok(())
}

/// Create the controller Deployment
pub async fn create_deckhouse_deployment(
    client: &Client,
    cfg: &InstallConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    run_task(client, &deployment_task(cfg), cancel).await
}

/// `replicas > 0`, every replica ready, none unavailable
pub fn deployment_is_ready(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let replicas = status.replicas.unwrap_or(0);
    replicas > 0
        && status.ready_replicas.unwrap_or(0) == replicas
        && status.unavailable_replicas.unwrap_or(0) == 0
}

/// Extract `msg` from a JSON log line, falling back to the raw line
pub fn log_message(line: &str) -> String {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("msg").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| line.to_string())
}

async fn print_controller_logs(pods: &Api<Pod>) {
    let params = ListParams::default().labels(&format!("app={}", DECKHOUSE_NAME));
    let pod = match pods.list(&params).await {
        Ok(list) => list.items.into_iter().next(),
        Err(e) => {
            debug!(error = %e, "Unable to list controller pods");
            return;
        }
    };
    let Some(name) = pod.and_then(|p| p.metadata.name) else {
        info!("[Deckhouse] Pod is not created yet");
        return;
    };

    let params = LogParams {
        since_seconds: Some(LOG_SAMPLE_INTERVAL.as_secs() as i64),
        ..Default::default()
    };
    match pods.logs(&name, &params).await {
        Ok(logs) => {
            for line in logs.lines().filter(|l| !l.trim().is_empty()) {
                info!("[Deckhouse] {}", log_message(line));
            }
        }
        Err(e) => debug!(pod = %name, error = %e, "Unable to read controller logs"),
    }
}

/// Wait for the controller Deployment, sampling its logs meanwhile
pub async fn wait_for_readiness(client: &Client, cancel: &CancellationToken) -> Result<()> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), DECKHOUSE_NAMESPACE);
    let pods: Api<Pod> = Api::namespaced(client.clone(), DECKHOUSE_NAMESPACE);
    let start = Instant::now();
    let mut last_sample: Option<Instant> = None;

    async move {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::loop_cancelled("Waiting for Deckhouse"));
            }
            if start.elapsed() > READINESS_TIMEOUT {
                return Err(Error::node_not_ready(format!(
                    "deckhouse deployment is not ready after {}m",
                    READINESS_TIMEOUT.as_secs() / 60
                )));
            }

            match deployments.get_opt(DECKHOUSE_NAME).await {
                Ok(Some(d)) if deployment_is_ready(&d) => {
                    info!("Deckhouse pod is Ready");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "Unable to get the deckhouse deployment"),
            }

            if last_sample.map_or(true, |t| t.elapsed() >= LOG_SAMPLE_INTERVAL) {
                print_controller_logs(&pods).await;
                last_sample = Some(Instant::now());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::loop_cancelled("Waiting for Deckhouse")),
                _ = tokio::time::sleep(READINESS_POLL_INTERVAL) => {}
            }
        }
    }
    .instrument(info_span!("wait_for_deckhouse"))
    .await
}

/// Wait until the API server answers
pub async fn wait_for_kubernetes_api(client: &Client, cancel: &CancellationToken) -> Result<()> {
    retry_loop(
        &RetryConfig::new(45, Duration::from_secs(5)),
        "Waiting for Kubernetes API to become Ready",
        cancel,
        || async {
            client
                .apiserver_version()
                .await
                .map(|_| ())
                .map_err(|e| Error::kube_api("get server version", e.to_string()))
        },
    )
    .await
}

/// Create the manifests and the Deployment, then wait for readiness
pub async fn install_deckhouse(
    client: &Client,
    cfg: &InstallConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("[Install] Creating platform manifests");
    create_deckhouse_manifests(client, cfg, cancel).await?;
    info!("[Install] Creating platform Deployment");
    create_deckhouse_deployment(client, cfg, cancel).await?;
    info!("[Install] Waiting for the platform to become Ready");
    wait_for_readiness(client, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use serde_json::json;

    #[test]
    fn test_image_for() {
        assert_eq!(image_for("registry.example.com/d8", "main", "").unwrap(), "registry.example.com/d8/dev:main");
        assert_eq!(
            image_for("registry.example.com/d8/", "", "EarlyAccess").unwrap(),
            "registry.example.com/d8:early-access"
        );
        assert!(image_for("registry.example.com/d8", "", "").is_err());
    }

    fn full_config() -> InstallConfig {
        InstallConfig {
            image: "r/dev:main".into(),
            registry_docker_cfg: "eyJhdXRocyI6e319".into(),
            deckhouse_config: json!({ "deckhouse": { "bundle": "Default" } }),
            cluster_config: b"kind: ClusterConfiguration".to_vec(),
            provider_cluster_config: b"kind: OpenStackClusterConfiguration".to_vec(),
            terraform_state: b"{}".to_vec(),
            cloud_discovery: b"{}".to_vec(),
            nodes_terraform_state: BTreeMap::from([(
                "test-master-0".to_string(),
                MasterNodeState {
                    state: b"{}".to_vec(),
                    data_device_path: "/dev/vdb".into(),
                },
            )]),
            uuid: "0b8c".into(),
            kube_dns_address: "10.222.0.10".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_install_tasks_order() {
        let names: Vec<String> = install_tasks(&full_config())
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(
            names,
            vec![
                r#"Namespace "d8-system""#,
                r#"Admin ClusterRole "cluster-admin""#,
                r#"ClusterRoleBinding "deckhouse""#,
                r#"ServiceAccount "deckhouse""#,
                r#"ConfigMap "deckhouse""#,
                r#"ConfigMap "install-data""#,
                r#"Secret "deckhouse-registry""#,
                r#"Secret "d8-cluster-terraform-state""#,
                r#"Secret "d8-node-terraform-state-test-master-0""#,
                r#"Secret "d8-masters-kubernetes-data-device-path""#,
                r#"Secret "d8-cluster-configuration""#,
                r#"Secret "d8-provider-cluster-configuration""#,
                r#"ConfigMap "d8-cluster-uuid""#,
                r#"Service "kube-dns""#,
            ]
        );
    }

    #[test]
    fn test_install_tasks_static_cluster() {
        let cfg = InstallConfig {
            image: "r/dev:main".into(),
            deckhouse_config: json!({}),
            cluster_config: b"kind: ClusterConfiguration".to_vec(),
            static_cluster_config: b"kind: StaticClusterConfiguration".to_vec(),
            ..Default::default()
        };
        let names: Vec<String> = install_tasks(&cfg).unwrap().into_iter().map(|t| t.name).collect();
        assert!(names.contains(&r#"Secret "d8-static-cluster-configuration""#.to_string()));
        assert!(!names.iter().any(|n| n.contains("terraform-state")));
        assert!(!names.iter().any(|n| n.contains("deckhouse-registry")));
        assert!(!names.iter().any(|n| n.contains("kube-dns")));
    }

    #[test]
    fn test_deployment_is_ready() {
        let with = |replicas, ready, unavailable| Deployment {
            status: Some(DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(ready),
                unavailable_replicas: unavailable,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(deployment_is_ready(&with(1, 1, None)));
        assert!(!deployment_is_ready(&with(0, 0, None)));
        assert!(!deployment_is_ready(&with(1, 0, None)));
        assert!(!deployment_is_ready(&with(1, 1, Some(1))));
        assert!(!deployment_is_ready(&Deployment::default()));
    }

    #[test]
    fn test_log_message() {
        assert_eq!(log_message(r#"{"level":"info","msg":"module started"}"#), "module started");
        assert_eq!(log_message("plain line"), "plain line");
    }

    #[test]
    fn test_prepare_install_config() {
        let mut meta = MetaConfig {
            cluster_dns_address: "10.222.0.10".into(),
            uuid: "0b8c".into(),
            ..Default::default()
        };
        meta.deckhouse_config.images_repo = "registry.example.com/d8".into();
        meta.deckhouse_config.release_channel = "Stable".into();
        meta.deckhouse_config.bundle = "Default".into();

        let cfg = prepare_install_config(&meta).unwrap();
        assert_eq!(cfg.image, "registry.example.com/d8:stable");
        assert_eq!(cfg.kube_dns_address, "10.222.0.10");
        assert_eq!(cfg.deckhouse_config["deckhouse"]["bundle"], "Default");
        assert!(cfg.provider_cluster_config.is_empty());
        assert!(!cfg.is_secure_registry());
    }
}
