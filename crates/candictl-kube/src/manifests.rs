//! Builders for the objects candictl writes into the cluster
//!
//! Names, keys and labels here are read back by later runs (converge, check,
//! destroy), so they must stay stable.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    HTTPGetAction, LocalObjectReference, Namespace, NamespaceSpec, ObjectFieldSelector,
    PodSecurityContext, PodSpec, PodTemplateSpec, Probe, Secret, Service, ServiceAccount,
    ServicePort, ServiceSpec, Toleration, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use serde_json::{json, Value};

use candictl_common::{Error, Result, DECKHOUSE_NAMESPACE, KUBE_SYSTEM_NAMESPACE};

/// Secret with the base infrastructure state
pub const CLUSTER_STATE_SECRET: &str = "d8-cluster-terraform-state";
/// Key of the base infrastructure state
pub const CLUSTER_STATE_KEY: &str = "cluster-tf-state.json";

/// Prefix of per-node state Secrets
pub const NODE_STATE_SECRET_PREFIX: &str = "d8-node-terraform-state-";
/// Key of a node state
pub const NODE_STATE_KEY: &str = "node-tf-state.json";
/// Key of the node group shape captured when the node was created
pub const NODE_GROUP_SETTINGS_KEY: &str = "node-group-settings.json";

/// Marks a Secret as holding node state
pub const TERRAFORM_STATE_LABEL: &str = "node.deckhouse.io/terraform-state";
/// Node group of a node state Secret
pub const NODE_GROUP_LABEL: &str = "node.deckhouse.io/node-group";
/// Node name of a node state Secret
pub const NODE_NAME_LABEL: &str = "node.deckhouse.io/node-name";

/// Secret mapping master names to their data device
pub const MASTERS_DATA_DEVICE_SECRET: &str = "d8-masters-kubernetes-data-device-path";

/// Secret with `ClusterConfiguration`
pub const CLUSTER_CONFIG_SECRET: &str = "d8-cluster-configuration";
/// Key of `ClusterConfiguration`
pub const CLUSTER_CONFIG_KEY: &str = "cluster-configuration.yaml";

/// Secret with the provider configuration and discovery data
pub const PROVIDER_CONFIG_SECRET: &str = "d8-provider-cluster-configuration";
/// Key of the provider configuration
pub const PROVIDER_CONFIG_KEY: &str = "cloud-provider-cluster-configuration.yaml";
/// Key of the provider discovery data
pub const CLOUD_DISCOVERY_KEY: &str = "cloud-provider-discovery-data.json";

/// Secret with `StaticClusterConfiguration`
pub const STATIC_CONFIG_SECRET: &str = "d8-static-cluster-configuration";
/// Key of `StaticClusterConfiguration`
pub const STATIC_CONFIG_KEY: &str = "static-cluster-configuration.yaml";

/// ConfigMap with the cluster UUID
pub const CLUSTER_UUID_CONFIG_MAP: &str = "d8-cluster-uuid";
/// Key of the cluster UUID
pub const CLUSTER_UUID_KEY: &str = "cluster-uuid";

/// Name shared by the platform Deployment, ServiceAccount and module ConfigMap
pub const DECKHOUSE_NAME: &str = "deckhouse";
/// Pull secret of the platform image
pub const REGISTRY_SECRET: &str = "deckhouse-registry";

const HERITAGE_LABEL: &str = "heritage";
const HERITAGE: &str = "deckhouse";

/// Name of the state Secret of `node`
pub fn node_state_secret_name(node: &str) -> String {
    format!("{}{}", NODE_STATE_SECRET_PREFIX, node)
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn helm_annotations() -> BTreeMap<String, String> {
    labels(&[
        ("meta.helm.sh/release-name", DECKHOUSE_NAME),
        ("meta.helm.sh/release-namespace", DECKHOUSE_NAMESPACE),
    ])
}

fn generate_secret(
    name: &str,
    namespace: &str,
    data: BTreeMap<String, ByteString>,
    extra_labels: &[(&str, &str)],
) -> Secret {
    let mut l = labels(&[(HERITAGE_LABEL, HERITAGE), ("name", name)]);
    l.extend(labels(extra_labels));
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(l),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

fn bytes(key: &str, value: &[u8]) -> (String, ByteString) {
    (key.to_string(), ByteString(value.to_vec()))
}

/// `d8-cluster-terraform-state`
pub fn cluster_state_secret(state: &[u8]) -> Secret {
    generate_secret(
        CLUSTER_STATE_SECRET,
        DECKHOUSE_NAMESPACE,
        BTreeMap::from([bytes(CLUSTER_STATE_KEY, state)]),
        &[],
    )
}

/// Merge patch replacing the base infrastructure state
pub fn cluster_state_patch(state: &[u8]) -> Value {
    json!({ "data": { CLUSTER_STATE_KEY: ByteString(state.to_vec()) } })
}

/// `d8-node-terraform-state-<node>`; empty `settings` are left out
pub fn node_state_secret(node: &str, group: &str, state: &[u8], settings: &[u8]) -> Secret {
    let mut data = BTreeMap::from([bytes(NODE_STATE_KEY, state)]);
    if !settings.is_empty() {
        data.extend([bytes(NODE_GROUP_SETTINGS_KEY, settings)]);
    }
    generate_secret(
        &node_state_secret_name(node),
        DECKHOUSE_NAMESPACE,
        data,
        &[
            (NODE_GROUP_LABEL, group),
            (NODE_NAME_LABEL, node),
            (TERRAFORM_STATE_LABEL, ""),
        ],
    )
}

/// Merge patch replacing a node state
pub fn node_state_patch(state: &[u8]) -> Value {
    json!({ "data": { NODE_STATE_KEY: ByteString(state.to_vec()) } })
}

/// `d8-masters-kubernetes-data-device-path` with a single master entry
pub fn master_device_path_secret(node: &str, device_path: &str) -> Secret {
    generate_secret(
        MASTERS_DATA_DEVICE_SECRET,
        DECKHOUSE_NAMESPACE,
        BTreeMap::from([bytes(node, device_path.as_bytes())]),
        &[],
    )
}

/// Merge patch adding one master entry to the device path Secret
pub fn master_device_path_patch(node: &str, device_path: &str) -> Value {
    json!({ "data": { node: ByteString(device_path.as_bytes().to_vec()) } })
}

/// `d8-cluster-configuration`
pub fn cluster_config_secret(config: &[u8]) -> Secret {
    generate_secret(
        CLUSTER_CONFIG_SECRET,
        KUBE_SYSTEM_NAMESPACE,
        BTreeMap::from([bytes(CLUSTER_CONFIG_KEY, config)]),
        &[],
    )
}

/// `d8-provider-cluster-configuration`; empty parts are left out
pub fn provider_config_secret(config: &[u8], discovery: &[u8]) -> Secret {
    let mut data = BTreeMap::new();
    if !config.is_empty() {
        data.extend([bytes(PROVIDER_CONFIG_KEY, config)]);
    }
    if !discovery.is_empty() {
        data.extend([bytes(CLOUD_DISCOVERY_KEY, discovery)]);
    }
    generate_secret(PROVIDER_CONFIG_SECRET, KUBE_SYSTEM_NAMESPACE, data, &[])
}

/// Merge patch replacing the provider discovery data
pub fn cloud_discovery_patch(discovery: &[u8]) -> Value {
    json!({ "data": { CLOUD_DISCOVERY_KEY: ByteString(discovery.to_vec()) } })
}

/// `d8-static-cluster-configuration`
pub fn static_config_secret(config: &[u8]) -> Secret {
    generate_secret(
        STATIC_CONFIG_SECRET,
        KUBE_SYSTEM_NAMESPACE,
        BTreeMap::from([bytes(STATIC_CONFIG_KEY, config)]),
        &[],
    )
}

/// `kube-system/d8-cluster-uuid`
pub fn cluster_uuid_config_map(uuid: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(CLUSTER_UUID_CONFIG_MAP.to_string()),
            namespace: Some(KUBE_SYSTEM_NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(labels(&[(CLUSTER_UUID_KEY, uuid)])),
        ..Default::default()
    }
}

/// `kube-system/kube-dns` pinned to `address`
pub fn kube_dns_service(address: &str) -> Service {
    let selector = labels(&[("k8s-app", "kube-dns")]);
    Service {
        metadata: ObjectMeta {
            name: Some("kube-dns".to_string()),
            namespace: Some(KUBE_SYSTEM_NAMESPACE.to_string()),
            labels: Some(selector.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some(address.to_string()),
            selector: Some(selector),
            ports: Some(vec![
                ServicePort {
                    name: Some("dns".to_string()),
                    port: 53,
                    protocol: Some("UDP".to_string()),
                    target_port: Some(IntOrString::Int(53)),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("dns-tcp".to_string()),
                    port: 53,
                    target_port: Some(IntOrString::Int(53)),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Namespace of the platform
pub fn deckhouse_namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels(&[
                (HERITAGE_LABEL, HERITAGE),
                ("extended-monitoring.deckhouse.io/enabled", ""),
            ])),
            ..Default::default()
        },
        spec: Some(NamespaceSpec {
            finalizers: Some(vec!["kubernetes".to_string()]),
        }),
        ..Default::default()
    }
}

/// `cluster-admin` with every permission
pub fn admin_cluster_role() -> ClusterRole {
    let all = || Some(vec!["*".to_string()]);
    ClusterRole {
        metadata: ObjectMeta {
            name: Some("cluster-admin".to_string()),
            labels: Some(labels(&[(HERITAGE_LABEL, HERITAGE)])),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: all(),
                resources: all(),
                verbs: vec!["*".to_string()],
                ..Default::default()
            },
            PolicyRule {
                non_resource_urls: all(),
                verbs: vec!["*".to_string()],
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

/// Binds the platform ServiceAccount to `cluster-admin`
pub fn admin_cluster_role_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(DECKHOUSE_NAME.to_string()),
            labels: Some(labels(&[(HERITAGE_LABEL, HERITAGE)])),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: "cluster-admin".to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: DECKHOUSE_NAME.to_string(),
            namespace: Some(DECKHOUSE_NAMESPACE.to_string()),
            ..Default::default()
        }]),
    }
}

/// ServiceAccount of the platform
pub fn deckhouse_service_account() -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(DECKHOUSE_NAME.to_string()),
            namespace: Some(DECKHOUSE_NAMESPACE.to_string()),
            labels: Some(labels(&[
                (HERITAGE_LABEL, HERITAGE),
                ("app.kubernetes.io/managed-by", "Helm"),
            ])),
            annotations: Some(helm_annotations()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Pull secret built from a base64-encoded docker config
pub fn registry_secret(docker_cfg_b64: &str) -> Result<Secret> {
    use base64::Engine;
    let docker_cfg = base64::engine::general_purpose::STANDARD
        .decode(docker_cfg_b64.trim())
        .map_err(|e| Error::config_invalid_in("InitConfiguration", format!("registryDockerCfg: {}", e)))?;
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(REGISTRY_SECRET.to_string()),
            namespace: Some(DECKHOUSE_NAMESPACE.to_string()),
            labels: Some(labels(&[
                (HERITAGE_LABEL, HERITAGE),
                ("app.kubernetes.io/managed-by", "Helm"),
                ("app", "registry"),
            ])),
            annotations: Some(helm_annotations()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(BTreeMap::from([bytes(".dockerconfigjson", &docker_cfg)])),
        ..Default::default()
    })
}

/// Module configuration ConfigMap: one YAML value per top-level key
pub fn deckhouse_config_map(config: &Value) -> Result<ConfigMap> {
    let mut data = BTreeMap::new();
    if let Some(modules) = config.as_object() {
        for (name, values) in modules {
            let yaml = serde_yaml::to_string(values)
                .map_err(|e| Error::serialization_for("ConfigMap", e.to_string()))?;
            data.insert(name.clone(), yaml);
        }
    }
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(DECKHOUSE_NAME.to_string()),
            namespace: Some(DECKHOUSE_NAMESPACE.to_string()),
            labels: Some(labels(&[(HERITAGE_LABEL, HERITAGE)])),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// `install-data` recording the installer version
pub fn install_data_config_map(version: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some("install-data".to_string()),
            namespace: Some(DECKHOUSE_NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(labels(&[("version", version)])),
        ..Default::default()
    }
}

/// Parameters of the platform Deployment
#[derive(Debug, Clone, Default)]
pub struct DeploymentParams {
    /// Controller image
    pub image: String,
    /// Value of `LOG_LEVEL`
    pub log_level: String,
    /// Value of `DECKHOUSE_BUNDLE`
    pub bundle: String,
    /// Attach the registry pull secret
    pub secure_registry: bool,
    /// Pin the pod to control-plane nodes
    pub master_node_selector: bool,
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn env_from_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: Some("v1".to_string()),
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn memory_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: Some("Memory".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

/// The platform controller Deployment
pub fn deckhouse_deployment(params: &DeploymentParams) -> Deployment {
    let selector = labels(&[("app", DECKHOUSE_NAME)]);

    let container = Container {
        name: DECKHOUSE_NAME.to_string(),
        image: Some(params.image.clone()),
        image_pull_policy: Some("Always".to_string()),
        command: Some(vec!["/deckhouse/deckhouse".to_string()]),
        working_dir: Some("/deckhouse".to_string()),
        readiness_probe: Some(Probe {
            initial_delay_seconds: Some(5),
            period_seconds: Some(5),
            failure_threshold: Some(120),
            http_get: Some(HTTPGetAction {
                path: Some("/ready".to_string()),
                port: IntOrString::Int(9650),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ports: Some(vec![
            ContainerPort {
                name: Some("self".to_string()),
                container_port: 9650,
                ..Default::default()
            },
            ContainerPort {
                name: Some("webhook".to_string()),
                container_port: 9651,
                ..Default::default()
            },
        ]),
        env: Some(vec![
            env_from_field("DECKHOUSE_POD", "metadata.name"),
            env_from_field("DECKHOUSE_NODE_NAME", "spec.nodeName"),
            env("HELM_HOST", "127.0.0.1:44434"),
            env("HELM3LIB", "yes"),
            env("HELM_HISTORY_MAX", "3"),
            env("ADDON_OPERATOR_CONFIG_MAP", DECKHOUSE_NAME),
            env("ADDON_OPERATOR_PROMETHEUS_METRICS_PREFIX", "deckhouse_"),
            env_from_field("ADDON_OPERATOR_NAMESPACE", "metadata.namespace"),
            env_from_field("ADDON_OPERATOR_LISTEN_ADDRESS", "status.podIP"),
            env("LOG_LEVEL", &params.log_level),
            env("LOG_TYPE", "json"),
            env("DECKHOUSE_BUNDLE", &params.bundle),
            env("MODULES_DIR", "/deckhouse/modules"),
        ]),
        volume_mounts: Some(vec![mount("tmp", "/tmp"), mount("kube", "/.kube")]),
        ..Default::default()
    };

    let mut pod = PodSpec {
        host_network: Some(true),
        dns_policy: Some("Default".to_string()),
        service_account_name: Some(DECKHOUSE_NAME.to_string()),
        security_context: Some(PodSecurityContext {
            run_as_user: Some(0),
            run_as_non_root: Some(false),
            ..Default::default()
        }),
        tolerations: Some(vec![Toleration {
            operator: Some("Exists".to_string()),
            ..Default::default()
        }]),
        volumes: Some(vec![memory_volume("tmp"), memory_volume("kube")]),
        containers: vec![container],
        ..Default::default()
    };
    if params.master_node_selector {
        pod.node_selector = Some(labels(&[("node-role.kubernetes.io/control-plane", "")]));
    }
    if params.secure_registry {
        pod.image_pull_secrets = Some(vec![LocalObjectReference {
            name: REGISTRY_SECRET.to_string(),
        }]);
    }

    Deployment {
        metadata: ObjectMeta {
            name: Some(DECKHOUSE_NAME.to_string()),
            namespace: Some(DECKHOUSE_NAMESPACE.to_string()),
            labels: Some(labels(&[
                (HERITAGE_LABEL, HERITAGE),
                ("app.kubernetes.io/managed-by", "Helm"),
            ])),
            annotations: Some(helm_annotations()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            revision_history_limit: Some(2),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_of(secret: &Secret, key: &str) -> Option<Vec<u8>> {
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|b| b.0.clone())
    }

    #[test]
    fn test_node_state_secret_labels() {
        let secret = node_state_secret("test-master-0", "master", b"{}", b"");
        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("d8-node-terraform-state-test-master-0")
        );
        assert_eq!(secret.metadata.namespace.as_deref(), Some("d8-system"));
        let labels = secret.metadata.labels.clone().unwrap();
        assert_eq!(labels[NODE_GROUP_LABEL], "master");
        assert_eq!(labels[NODE_NAME_LABEL], "test-master-0");
        assert_eq!(labels[TERRAFORM_STATE_LABEL], "");
        assert_eq!(labels["heritage"], "deckhouse");
        assert_eq!(data_of(&secret, NODE_STATE_KEY), Some(b"{}".to_vec()));
        assert_eq!(data_of(&secret, NODE_GROUP_SETTINGS_KEY), None);
    }

    #[test]
    fn test_node_state_secret_with_settings() {
        let secret = node_state_secret("test-front-1", "front", b"{}", br#"{"name":"front"}"#);
        assert_eq!(
            data_of(&secret, NODE_GROUP_SETTINGS_KEY),
            Some(br#"{"name":"front"}"#.to_vec())
        );
    }

    #[test]
    fn test_patches_are_base64() {
        let patch = cluster_state_patch(b"state");
        assert_eq!(patch["data"][CLUSTER_STATE_KEY], "c3RhdGU=");
        let patch = master_device_path_patch("test-master-0", "/dev/vdb");
        assert_eq!(patch["data"]["test-master-0"], "L2Rldi92ZGI=");
    }

    #[test]
    fn test_provider_config_secret_skips_empty_parts() {
        let secret = provider_config_secret(b"kind: X", b"");
        let data = secret.data.unwrap();
        assert!(data.contains_key(PROVIDER_CONFIG_KEY));
        assert!(!data.contains_key(CLOUD_DISCOVERY_KEY));
    }

    #[test]
    fn test_registry_secret_decodes_docker_cfg() {
        let secret = registry_secret("eyJhdXRocyI6e319").unwrap();
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/dockerconfigjson"));
        assert_eq!(
            data_of(&secret, ".dockerconfigjson"),
            Some(br#"{"auths":{}}"#.to_vec())
        );
        assert!(registry_secret("%%%").is_err());
    }

    #[test]
    fn test_config_map_has_yaml_per_module() {
        let cm = deckhouse_config_map(&json!({
            "deckhouse": { "bundle": "Default", "logLevel": "Info" },
            "prometheusEnabled": false,
        }))
        .unwrap();
        let data = cm.data.unwrap();
        assert_eq!(data["prometheusEnabled"].trim(), "false");
        let deckhouse: Value = serde_yaml::from_str(&data["deckhouse"]).unwrap();
        assert_eq!(deckhouse["bundle"], "Default");
    }

    #[test]
    fn test_deployment_pull_secret_and_selector() {
        let plain = deckhouse_deployment(&DeploymentParams {
            image: "registry/dev:main".into(),
            ..Default::default()
        });
        let pod = plain.spec.unwrap().template.spec.unwrap();
        assert!(pod.image_pull_secrets.is_none());
        assert!(pod.node_selector.is_none());
        assert_eq!(pod.containers[0].image.as_deref(), Some("registry/dev:main"));

        let secure = deckhouse_deployment(&DeploymentParams {
            image: "registry/dev:main".into(),
            secure_registry: true,
            master_node_selector: true,
            ..Default::default()
        });
        let pod = secure.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.image_pull_secrets.unwrap()[0].name, REGISTRY_SECRET);
        assert!(pod
            .node_selector
            .unwrap()
            .contains_key("node-role.kubernetes.io/control-plane"));
    }

    #[test]
    fn test_kube_dns_service_address() {
        let svc = kube_dns_service("10.222.0.10");
        assert_eq!(
            svc.spec.unwrap().cluster_ip.as_deref(),
            Some("10.222.0.10")
        );
    }
}
