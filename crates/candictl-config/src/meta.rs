//! MetaConfig: the merged, typed view over the four configuration documents
//!
//! The raw documents are kept as JSON maps so they can be written back to the
//! cluster and handed to the IaC tool unchanged. [`MetaConfig::prepare`]
//! derives the typed fields from them.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use candictl_common::{Error, Result, MASTER_NODE_GROUP};

/// A raw configuration document keyed by top-level field
pub type RawDocument = BTreeMap<String, Value>;

/// How cluster machines are provisioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterType {
    /// Machines are ordered from a cloud provider via the IaC tool
    Cloud,
    /// Machines are provided by the operator
    Static,
}

impl ClusterType {
    /// Name as it appears in `ClusterConfiguration.clusterType`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloud => "Cloud",
            Self::Static => "Static",
        }
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Cloud" => Ok(Self::Cloud),
            "Static" => Ok(Self::Static),
            other => Err(Error::config_invalid_in(
                "ClusterConfiguration",
                format!("unknown clusterType {:?}, expected Cloud or Static", other),
            )),
        }
    }
}

/// `InitConfiguration.deckhouse`: how the platform is installed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeckhouseClusterConfig {
    /// Image repository
    pub images_repo: String,
    /// Base64-encoded docker config for the repository
    pub registry_docker_cfg: String,
    /// Release channel, mutually exclusive with `dev_branch`
    pub release_channel: String,
    /// Development image tag
    pub dev_branch: String,
    /// Module bundle
    pub bundle: String,
    /// Platform log level
    pub log_level: String,
    /// Module configuration overrides
    pub config_overrides: Map<String, Value>,
}

/// `masterNodeGroup` of the provider configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MasterNodeGroupSpec {
    /// Declared number of masters
    pub replicas: u32,
    /// Provider-specific instance class
    pub instance_class: Value,
}

/// An element of `nodeGroups` of the provider configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TerraNodeGroupSpec {
    /// Node group name
    pub name: String,
    /// Declared number of nodes
    pub replicas: u32,
    /// Labels, annotations and taints applied to the nodes
    pub node_template: Option<Value>,
    /// Provider-specific instance class
    pub instance_class: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CloudSpec {
    provider: String,
    prefix: String,
}

/// Typed projection of the user's configuration documents
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaConfig {
    /// Cloud or Static; `None` when no cluster document was given
    pub cluster_type: Option<ClusterType>,
    /// Kebab-cased provider layout
    pub layout: String,
    /// Lowercased provider name
    pub provider_name: String,
    /// Provider name as written by the user
    pub original_provider_name: String,
    /// Prefix of every cloud resource and node name
    pub cluster_prefix: String,
    /// Tenth address of the service subnet
    pub cluster_dns_address: String,

    /// Platform install settings
    pub deckhouse_config: DeckhouseClusterConfig,
    /// Master node group
    pub master_node_group_spec: MasterNodeGroupSpec,
    /// Non-master node groups ordered by the IaC tool
    pub terra_node_group_specs: Vec<TerraNodeGroupSpec>,

    /// `ClusterConfiguration`
    pub cluster_config: RawDocument,
    /// `InitConfiguration`
    pub init_cluster_config: RawDocument,
    /// `<Provider>ClusterConfiguration`
    pub provider_cluster_config: RawDocument,
    /// `StaticClusterConfiguration`
    pub static_cluster_config: RawDocument,

    /// Cluster identifier, set once per cluster
    pub uuid: String,
}

fn field<T: serde::de::DeserializeOwned>(
    doc: &RawDocument,
    key: &str,
    document: &str,
) -> Result<T> {
    let value = doc.get(key).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| {
        Error::config_invalid_in(document, format!("unable to parse {}: {}", key, e))
    })
}

impl MetaConfig {
    /// Derive the typed fields from the raw documents
    pub fn prepare(mut self) -> Result<Self> {
        if !self.cluster_config.is_empty() {
            let cluster_type: String =
                field(&self.cluster_config, "clusterType", "ClusterConfiguration")?;
            self.cluster_type = Some(cluster_type.parse()?);

            let service_subnet: String =
                field(&self.cluster_config, "serviceSubnetCIDR", "ClusterConfiguration")?;
            self.cluster_dns_address = dns_address(&service_subnet);
        }

        if !self.init_cluster_config.is_empty() {
            self.deckhouse_config =
                field(&self.init_cluster_config, "deckhouse", "InitConfiguration")?;
        }

        if self.cluster_type != Some(ClusterType::Cloud) {
            return Ok(self);
        }
        if self.provider_cluster_config.is_empty() {
            return Err(Error::config_invalid(
                "provider cluster configuration is required for Cloud clusters",
            ));
        }

        let layout: String = field(
            &self.provider_cluster_config,
            "layout",
            "ProviderClusterConfiguration",
        )?;
        self.layout = to_kebab(&layout);

        let cloud: CloudSpec = field(&self.cluster_config, "cloud", "ClusterConfiguration")?;
        self.provider_name = cloud.provider.to_lowercase();
        self.original_provider_name = cloud.provider;
        self.cluster_prefix = cloud.prefix;

        self.master_node_group_spec = field(
            &self.provider_cluster_config,
            "masterNodeGroup",
            "ProviderClusterConfiguration",
        )?;

        self.terra_node_group_specs = match self.provider_cluster_config.get("nodeGroups") {
            Some(_) => field(
                &self.provider_cluster_config,
                "nodeGroups",
                "ProviderClusterConfiguration",
            )?,
            None => Vec::new(),
        };

        Ok(self)
    }

    /// Cloud cluster
    pub fn is_cloud(&self) -> bool {
        self.cluster_type == Some(ClusterType::Cloud)
    }

    /// Platform module configuration merged from config files, overrides and
    /// the install settings.
    ///
    /// Without `configs` the overrides take precedence over the install
    /// settings; with them the install settings are applied last.
    pub fn merge_deckhouse_config(&self, configs: &[&[u8]]) -> Result<Value> {
        let mut module = Map::new();
        module.insert("logLevel".into(), json!(self.deckhouse_config.log_level));
        module.insert("bundle".into(), json!(self.deckhouse_config.bundle));
        if !self.deckhouse_config.release_channel.is_empty() {
            module.insert(
                "releaseChannel".into(),
                json!(self.deckhouse_config.release_channel),
            );
        }
        let base = json!({ "deckhouse": module });
        let overrides = Value::Object(self.deckhouse_config.config_overrides.clone());

        let Some((first, rest)) = configs.split_first() else {
            let mut merged = base;
            merge_values(&mut merged, &overrides);
            return Ok(merged);
        };

        let mut merged: Value = serde_json::from_slice(first)
            .map_err(|e| Error::config_invalid(format!("platform config: {}", e)))?;
        for raw in rest {
            let next: Value = serde_json::from_slice(raw)
                .map_err(|e| Error::config_invalid(format!("platform config: {}", e)))?;
            merge_values(&mut merged, &next);
        }
        merge_values(&mut merged, &overrides);
        merge_values(&mut merged, &base);
        Ok(merged)
    }

    /// Raw provider settings of the node group `name`
    pub fn find_terra_node_group(&self, name: &str) -> Option<Value> {
        let index = self
            .terra_node_group_specs
            .iter()
            .position(|ng| ng.name == name)?;
        self.provider_cluster_config
            .get("nodeGroups")
            .and_then(Value::as_array)
            .and_then(|groups| groups.get(index))
            .cloned()
    }

    /// Declared replicas of `group`, `None` when the group is not declared
    pub fn declared_replicas(&self, group: &str) -> Option<u32> {
        if group == MASTER_NODE_GROUP {
            return Some(self.master_node_group_spec.replicas);
        }
        self.terra_node_group_specs
            .iter()
            .find(|ng| ng.name == group)
            .map(|ng| ng.replicas)
    }

    /// Static settings of the master node group
    pub fn extract_master_node_group_static_settings(&self) -> Map<String, Value> {
        let mut settings = Map::new();
        if self.static_cluster_config.is_empty() {
            return settings;
        }

        let cidrs = match self.static_cluster_config.get("internalNetworkCIDRs") {
            Some(value) => match serde_json::from_value::<Vec<String>>(value.clone()) {
                Ok(cidrs) => Value::from(cidrs),
                Err(e) => {
                    debug!(error = %e, "Unable to parse internalNetworkCIDRs");
                    return settings;
                }
            },
            None => Value::Null,
        };
        settings.insert("internalNetworkCIDRs".into(), cidrs);
        settings
    }

    /// NodeGroup resource for the masters
    pub fn master_node_group_manifest(&self) -> Value {
        let node_type = if self.cluster_type == Some(ClusterType::Static) {
            "Static"
        } else {
            "Hybrid"
        };
        json!({
            "apiVersion": "deckhouse.io/v1alpha1",
            "kind": "NodeGroup",
            "metadata": { "name": MASTER_NODE_GROUP },
            "spec": {
                "nodeType": node_type,
                "disruptions": { "approvalMode": "Manual" },
                "nodeTemplate": {
                    "labels": { "node-role.kubernetes.io/master": "" },
                    "taints": [
                        { "key": "node-role.kubernetes.io/master", "effect": "NoSchedule" }
                    ],
                },
            },
        })
    }

    /// NodeGroup resource for a group ordered by the IaC tool
    pub fn node_group_manifest(&self, group: &TerraNodeGroupSpec) -> Value {
        let template = group
            .node_template
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()));
        json!({
            "apiVersion": "deckhouse.io/v1alpha1",
            "kind": "NodeGroup",
            "metadata": { "name": group.name },
            "spec": {
                "nodeType": "Hybrid",
                "disruptions": { "approvalMode": "Manual" },
                "nodeTemplate": template,
            },
        })
    }

    fn config_json(&self, with_static: bool) -> Value {
        let mut out = Map::new();
        out.insert("clusterConfiguration".into(), json!(self.cluster_config));
        if !self.provider_cluster_config.is_empty() {
            out.insert(
                "providerClusterConfiguration".into(),
                json!(self.provider_cluster_config),
            );
        }
        if with_static && !self.static_cluster_config.is_empty() {
            out.insert(
                "staticClusterConfiguration".into(),
                json!(self.static_cluster_config),
            );
        }
        if !self.uuid.is_empty() {
            out.insert("clusterUUID".into(), json!(self.uuid));
        }
        Value::Object(out)
    }

    /// IaC variables for the base infrastructure step
    pub fn marshal_config(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.config_json(false))?)
    }

    /// Every document, including the static configuration
    pub fn marshal_full_config(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.config_json(true))?)
    }

    /// IaC variables for one node of `group`
    pub fn node_group_config(
        &self,
        group: &str,
        index: u32,
        cloud_config: &str,
    ) -> Result<Vec<u8>> {
        let mut out = Map::new();
        out.insert("clusterConfiguration".into(), json!(self.cluster_config));
        out.insert(
            "providerClusterConfiguration".into(),
            json!(self.provider_cluster_config),
        );
        out.insert("nodeIndex".into(), json!(index));
        out.insert("cloudConfig".into(), json!(cloud_config));
        if group != MASTER_NODE_GROUP {
            out.insert("nodeGroupName".into(), json!(group));
        }
        if !self.uuid.is_empty() {
            out.insert("clusterUUID".into(), json!(self.uuid));
        }
        Ok(serde_json::to_vec(&Value::Object(out))?)
    }

    /// `ClusterConfiguration` as YAML
    pub fn cluster_config_yaml(&self) -> Result<String> {
        to_yaml(&self.cluster_config)
    }

    /// Provider configuration as YAML, empty when absent
    pub fn provider_cluster_config_yaml(&self) -> Result<String> {
        if self.provider_cluster_config.is_empty() {
            return Ok(String::new());
        }
        to_yaml(&self.provider_cluster_config)
    }

    /// Static configuration as YAML, empty when absent
    pub fn static_cluster_config_yaml(&self) -> Result<String> {
        if self.static_cluster_config.is_empty() {
            return Ok(String::new());
        }
        to_yaml(&self.static_cluster_config)
    }

    /// Values for the kubeadm templates. Without `node_ip` bashible discovers it.
    pub fn config_for_kubeadm_templates(&self, node_ip: Option<&str>) -> Value {
        json!({
            "extraArgs": {},
            "clusterConfiguration": self.cluster_config,
            "nodeIP": node_ip.unwrap_or("$MY_IP"),
        })
    }

    /// Values for the bashible bundle templates of the first master
    pub fn config_for_bashible_bundle(&self, bundle: &str, node_ip: Option<&str>) -> Value {
        let mut bootstrap = Map::new();
        bootstrap.insert(
            "clusterDomain".into(),
            self.cluster_config
                .get("clusterDomain")
                .cloned()
                .unwrap_or(Value::Null),
        );
        bootstrap.insert("clusterDNSAddress".into(), json!(self.cluster_dns_address));
        if let Some(ip) = node_ip.filter(|ip| !ip.is_empty()) {
            bootstrap.insert("cloud".into(), json!({ "nodeIP": ip }));
        }

        let mut node_group = Map::new();
        node_group.insert("name".into(), json!(MASTER_NODE_GROUP));
        node_group.insert("nodeType".into(), json!("Hybrid"));
        node_group.insert(
            "cloudInstances".into(),
            json!({ "classReference": { "name": MASTER_NODE_GROUP } }),
        );
        if self.cluster_type == Some(ClusterType::Static) {
            node_group.insert("nodeType".into(), json!("Static"));
            node_group.insert(
                "static".into(),
                Value::Object(self.extract_master_node_group_static_settings()),
            );
        }

        json!({
            "runType": "ClusterBootstrap",
            "bundle": bundle,
            "kubernetesVersion": self.cluster_config.get("kubernetesVersion").cloned().unwrap_or(Value::Null),
            "nodeGroup": node_group,
            "clusterBootstrap": bootstrap,
        })
    }

    /// Name of the bootstrap state cache
    pub fn cache_path(&self) -> String {
        format!(
            "{}-{}-terraform-state-cache",
            self.cluster_prefix, self.provider_name
        )
    }

    /// Copy whose provider `nodeGroups` holds only `settings`.
    ///
    /// Used when destroying a node so the IaC tool sees the group shape it was
    /// created with.
    pub fn with_node_group_settings(&self, settings: &[u8]) -> Result<Self> {
        let mut copy = self.clone();
        if settings.is_empty() {
            return Ok(copy);
        }
        let group: Value = serde_json::from_slice(settings)
            .map_err(|e| Error::serialization_for("node-group-settings.json", e.to_string()))?;
        copy.provider_cluster_config
            .insert("nodeGroups".into(), Value::Array(vec![group]));
        Ok(copy)
    }
}

fn to_yaml(doc: &RawDocument) -> Result<String> {
    serde_yaml::to_string(doc).map_err(|e| Error::serialization(e.to_string()))
}

/// Recursively merge `src` into `dst`. Objects merge key by key, anything
/// else in `src` replaces the value in `dst`.
pub fn merge_values(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(dst), Value::Object(src)) => {
            for (key, value) in src {
                match dst.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_values(existing, value)
                    }
                    _ => {
                        dst.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}

/// Cluster DNS address: the tenth address after the network address.
///
/// Returns an empty string for invalid CIDRs and for networks too small to
/// hold it.
///
/// ```
/// use candictl_config::meta::dns_address;
///
/// assert_eq!(dns_address("10.222.0.0/16"), "10.222.0.10");
/// assert_eq!(dns_address("192.168.0.18/28"), "192.168.0.26");
/// assert_eq!(dns_address("10.0.0.1/32"), "");
/// ```
pub fn dns_address(cidr: &str) -> String {
    const OFFSET: u32 = 10;

    let Some((addr, prefix)) = cidr.trim().split_once('/') else {
        debug!(cidr, "serviceSubnetCIDR is not a valid CIDR");
        return String::new();
    };
    let (Ok(ip), Ok(prefix)) = (addr.parse::<IpAddr>(), prefix.parse::<u32>()) else {
        debug!(cidr, "serviceSubnetCIDR is not a valid CIDR");
        return String::new();
    };

    match ip {
        IpAddr::V4(v4) => {
            if prefix > 32 || 32 - prefix < 4 {
                return String::new();
            }
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            let network = u32::from(v4) & mask;
            Ipv4Addr::from(network + OFFSET).to_string()
        }
        IpAddr::V6(v6) => {
            if prefix > 128 || 128 - prefix < 4 {
                return String::new();
            }
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            let network = u128::from(v6) & mask;
            Ipv6Addr::from(network + u128::from(OFFSET)).to_string()
        }
    }
}

/// Kebab-case an identifier: `WithNATInstance` becomes `with-nat-instance`
pub fn to_kebab(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c == '_' || c == ' ' || c == '-' || c == '.' {
            if !out.is_empty() && !out.ends_with('-') {
                out.push('-');
            }
            continue;
        }
        if c.is_uppercase() && i > 0 && !out.is_empty() && !out.ends_with('-') {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower)
            {
                out.push('-');
            }
        }
        out.extend(c.to_lowercase());
    }
    out.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(value: Value) -> RawDocument {
        serde_json::from_value(value).unwrap()
    }

    fn cloud_meta() -> MetaConfig {
        MetaConfig {
            cluster_config: doc(json!({
                "apiVersion": "deckhouse.io/v1",
                "kind": "ClusterConfiguration",
                "clusterType": "Cloud",
                "cloud": { "provider": "OpenStack", "prefix": "test" },
                "kubernetesVersion": "1.16",
                "clusterDomain": "cluster.local",
                "podSubnetCIDR": "10.222.0.0/16",
                "serviceSubnetCIDR": "10.111.0.0/16",
            })),
            provider_cluster_config: doc(json!({
                "apiVersion": "deckhouse.io/v1",
                "kind": "OpenStackClusterConfiguration",
                "layout": "StandardWithNoRouter",
                "masterNodeGroup": { "replicas": 3, "instanceClass": { "flavorName": "m1" } },
                "nodeGroups": [
                    { "name": "front", "replicas": 2, "instanceClass": { "flavorName": "m2" } },
                    { "name": "system", "replicas": 1, "nodeTemplate": { "labels": { "a": "b" } } },
                ],
            })),
            init_cluster_config: doc(json!({
                "deckhouse": {
                    "imagesRepo": "registry.example.com/deckhouse",
                    "releaseChannel": "EarlyAccess",
                    "bundle": "Default",
                    "logLevel": "Info",
                    "configOverrides": { "global": { "modules": { "publicDomainTemplate": "%s.example.com" } } },
                },
            })),
            ..Default::default()
        }
        .prepare()
        .unwrap()
    }

    #[test]
    fn test_dns_address() {
        assert_eq!(dns_address("10.111.0.0/16"), "10.111.0.10");
        assert_eq!(dns_address("10.222.0.0/16"), "10.222.0.10");
        assert_eq!(dns_address("192.168.0.18/28"), "192.168.0.26");
        assert_eq!(dns_address("10.0.0.0/29"), "");
        assert_eq!(dns_address("10.0.0.1/32"), "");
        assert_eq!(dns_address("bad cidr"), "");
        assert_eq!(dns_address("10.0.0.0/33"), "");
        assert_eq!(dns_address("fd00::/64"), "fd00::a");
    }

    #[test]
    fn test_to_kebab() {
        assert_eq!(to_kebab("WithNATInstance"), "with-nat-instance");
        assert_eq!(to_kebab("Standard"), "standard");
        assert_eq!(to_kebab("StandardWithNoRouter"), "standard-with-no-router");
        assert_eq!(to_kebab("EarlyAccess"), "early-access");
        assert_eq!(to_kebab("rock_solid"), "rock-solid");
    }

    #[test]
    fn test_prepare_cloud() {
        let meta = cloud_meta();
        assert_eq!(meta.cluster_type, Some(ClusterType::Cloud));
        assert_eq!(meta.provider_name, "openstack");
        assert_eq!(meta.original_provider_name, "OpenStack");
        assert_eq!(meta.cluster_prefix, "test");
        assert_eq!(meta.layout, "standard-with-no-router");
        assert_eq!(meta.cluster_dns_address, "10.111.0.10");
        assert_eq!(meta.master_node_group_spec.replicas, 3);
        assert_eq!(meta.terra_node_group_specs.len(), 2);
        assert_eq!(meta.terra_node_group_specs[0].name, "front");
        assert_eq!(meta.cache_path(), "test-openstack-terraform-state-cache");
        assert_eq!(meta.deckhouse_config.release_channel, "EarlyAccess");
    }

    #[test]
    fn test_cloud_without_provider_config_is_invalid() {
        let meta = MetaConfig {
            cluster_config: doc(json!({
                "clusterType": "Cloud",
                "serviceSubnetCIDR": "10.111.0.0/16",
            })),
            ..Default::default()
        };
        assert!(matches!(meta.prepare(), Err(Error::ConfigInvalid { .. })));
    }

    #[test]
    fn test_unknown_cluster_type() {
        let meta = MetaConfig {
            cluster_config: doc(json!({ "clusterType": "Hybrid", "serviceSubnetCIDR": "10.0.0.0/8" })),
            ..Default::default()
        };
        assert!(meta.prepare().is_err());
    }

    #[test]
    fn test_declared_replicas() {
        let meta = cloud_meta();
        assert_eq!(meta.declared_replicas("master"), Some(3));
        assert_eq!(meta.declared_replicas("front"), Some(2));
        assert_eq!(meta.declared_replicas("unknown"), None);
    }

    #[test]
    fn test_find_terra_node_group_returns_raw_document() {
        let meta = cloud_meta();
        let raw = meta.find_terra_node_group("system").unwrap();
        assert_eq!(raw["nodeTemplate"]["labels"]["a"], "b");
        assert!(meta.find_terra_node_group("missing").is_none());
    }

    #[test]
    fn test_node_group_config() {
        let mut meta = cloud_meta();
        meta.uuid = "c0ffee".into();

        let master: Value =
            serde_json::from_slice(&meta.node_group_config("master", 1, "").unwrap()).unwrap();
        assert_eq!(master["nodeIndex"], 1);
        assert!(master.get("nodeGroupName").is_none());
        assert_eq!(master["clusterUUID"], "c0ffee");

        let front: Value =
            serde_json::from_slice(&meta.node_group_config("front", 0, "Y2xvdWQ=").unwrap())
                .unwrap();
        assert_eq!(front["nodeGroupName"], "front");
        assert_eq!(front["cloudConfig"], "Y2xvdWQ=");
        assert_eq!(front["providerClusterConfiguration"]["layout"], "StandardWithNoRouter");
    }

    #[test]
    fn test_marshal_config_excludes_static() {
        let mut meta = cloud_meta();
        meta.static_cluster_config = doc(json!({ "internalNetworkCIDRs": ["10.0.0.0/24"] }));

        let short: Value = serde_json::from_slice(&meta.marshal_config().unwrap()).unwrap();
        assert!(short.get("staticClusterConfiguration").is_none());
        assert!(short.get("clusterUUID").is_none());

        let full: Value = serde_json::from_slice(&meta.marshal_full_config().unwrap()).unwrap();
        assert!(full.get("staticClusterConfiguration").is_some());
    }

    #[test]
    fn test_merge_deckhouse_config_without_files() {
        let meta = cloud_meta();
        let merged = meta.merge_deckhouse_config(&[]).unwrap();
        assert_eq!(merged["deckhouse"]["releaseChannel"], "EarlyAccess");
        assert_eq!(merged["deckhouse"]["bundle"], "Default");
        assert_eq!(
            merged["global"]["modules"]["publicDomainTemplate"],
            "%s.example.com"
        );
    }

    #[test]
    fn test_merge_deckhouse_config_install_settings_win() {
        let meta = cloud_meta();
        let base = br#"{"deckhouse": {"bundle": "Minimal", "extra": 1}, "foo": {"a": 1}}"#;
        let more = br#"{"foo": {"b": 2}}"#;
        let merged = meta
            .merge_deckhouse_config(&[base.as_slice(), more.as_slice()])
            .unwrap();
        assert_eq!(merged["deckhouse"]["bundle"], "Default");
        assert_eq!(merged["deckhouse"]["extra"], 1);
        assert_eq!(merged["foo"], json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_master_node_group_manifest() {
        let mut meta = cloud_meta();
        assert_eq!(meta.master_node_group_manifest()["spec"]["nodeType"], "Hybrid");
        meta.cluster_type = Some(ClusterType::Static);
        let manifest = meta.master_node_group_manifest();
        assert_eq!(manifest["spec"]["nodeType"], "Static");
        assert_eq!(manifest["spec"]["disruptions"]["approvalMode"], "Manual");
        assert_eq!(
            manifest["spec"]["nodeTemplate"]["taints"][0]["effect"],
            "NoSchedule"
        );
    }

    #[test]
    fn test_node_group_manifest_defaults_template() {
        let meta = cloud_meta();
        let manifest = meta.node_group_manifest(&meta.terra_node_group_specs[0]);
        assert_eq!(manifest["metadata"]["name"], "front");
        assert_eq!(manifest["spec"]["nodeTemplate"], json!({}));
    }

    #[test]
    fn test_bashible_bundle_values_static() {
        let meta = MetaConfig {
            cluster_config: doc(json!({
                "clusterType": "Static",
                "kubernetesVersion": "1.19",
                "clusterDomain": "cluster.local",
                "serviceSubnetCIDR": "10.111.0.0/16",
            })),
            static_cluster_config: doc(json!({ "internalNetworkCIDRs": ["192.168.0.0/24"] })),
            ..Default::default()
        }
        .prepare()
        .unwrap();

        let values = meta.config_for_bashible_bundle("ubuntu-lts", Some("10.0.0.5"));
        assert_eq!(values["runType"], "ClusterBootstrap");
        assert_eq!(values["kubernetesVersion"], "1.19");
        assert_eq!(values["nodeGroup"]["nodeType"], "Static");
        assert_eq!(
            values["nodeGroup"]["static"]["internalNetworkCIDRs"][0],
            "192.168.0.0/24"
        );
        assert_eq!(values["clusterBootstrap"]["clusterDNSAddress"], "10.111.0.10");
        assert_eq!(values["clusterBootstrap"]["cloud"]["nodeIP"], "10.0.0.5");
    }

    #[test]
    fn test_with_node_group_settings_does_not_touch_original() {
        let meta = cloud_meta();
        let copy = meta
            .with_node_group_settings(br#"{"name":"front","replicas":5}"#)
            .unwrap();
        assert_eq!(
            copy.provider_cluster_config["nodeGroups"],
            json!([{"name": "front", "replicas": 5}])
        );
        assert_eq!(
            meta.provider_cluster_config["nodeGroups"].as_array().unwrap().len(),
            2
        );
    }

    #[test]
    fn test_merge_values_replaces_scalars() {
        let mut dst = json!({"a": {"b": 1, "c": [1]}, "d": 1});
        merge_values(&mut dst, &json!({"a": {"c": [2]}, "d": {"e": 1}}));
        assert_eq!(dst, json!({"a": {"b": 1, "c": [2]}, "d": {"e": 1}}));
    }
}
