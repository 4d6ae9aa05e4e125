//! Cluster configuration stored in `kube-system` Secrets

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use candictl_common::retry::{retry_loop, RetryConfig};
use candictl_common::{Error, Result, KUBE_SYSTEM_NAMESPACE};
use candictl_config::parse::parse_config_from_cluster;
use candictl_config::{MetaConfig, SchemaStore};

use crate::manifests::{
    CLOUD_DISCOVERY_KEY, CLUSTER_CONFIG_KEY, CLUSTER_CONFIG_SECRET, PROVIDER_CONFIG_KEY,
    PROVIDER_CONFIG_SECRET, STATIC_CONFIG_KEY, STATIC_CONFIG_SECRET,
};

/// A configuration document kept in a Secret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSecret {
    /// `ClusterConfiguration`
    Cluster,
    /// `<Provider>ClusterConfiguration`
    Provider,
    /// `StaticClusterConfiguration`
    Static,
}

impl ConfigSecret {
    /// Secret name in `kube-system`
    pub fn secret_name(self) -> &'static str {
        match self {
            Self::Cluster => CLUSTER_CONFIG_SECRET,
            Self::Provider => PROVIDER_CONFIG_SECRET,
            Self::Static => STATIC_CONFIG_SECRET,
        }
    }

    /// Data key holding the YAML document
    pub fn key(self) -> &'static str {
        match self {
            Self::Cluster => CLUSTER_CONFIG_KEY,
            Self::Provider => PROVIDER_CONFIG_KEY,
            Self::Static => STATIC_CONFIG_KEY,
        }
    }
}

/// Configuration documents read from the cluster
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterConfigData {
    /// `ClusterConfiguration` YAML
    pub cluster_config: Vec<u8>,
    /// Provider configuration YAML, empty for static clusters
    pub provider_cluster_config: Vec<u8>,
    /// Provider discovery data
    pub cloud_discovery: Vec<u8>,
}

/// Value of `key`, empty when absent
pub fn secret_value(secret: &Secret, key: &str) -> Vec<u8> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|b| b.0.clone())
        .unwrap_or_default()
}

/// Merge patch replacing `key` of a config Secret
pub fn config_patch(key: &str, data: &[u8]) -> serde_json::Value {
    json!({ "data": { key: ByteString(data.to_vec()) } })
}

fn secrets(client: &Client) -> Api<Secret> {
    Api::namespaced(client.clone(), KUBE_SYSTEM_NAMESPACE)
}

/// Read one configuration document, `None` when its Secret does not exist
pub async fn read_config_secret(
    client: &Client,
    which: ConfigSecret,
    cancel: &CancellationToken,
) -> Result<Option<Vec<u8>>> {
    let api = secrets(client);
    let name = which.secret_name();
    let secret = retry_loop(
        &RetryConfig::state_reads(),
        &format!("Get {} Secret", name),
        cancel,
        || async { Ok(api.get_opt(name).await?) },
    )
    .await?;
    Ok(secret.map(|s| secret_value(&s, which.key())))
}

/// Replace one configuration document
pub async fn write_config_secret(
    client: &Client,
    which: ConfigSecret,
    data: &[u8],
    cancel: &CancellationToken,
) -> Result<()> {
    let api = secrets(client);
    let name = which.secret_name();
    let patch = config_patch(which.key(), data);
    retry_loop(
        &RetryConfig::state_writes(),
        &format!("Update {} Secret", name),
        cancel,
        || async {
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(())
        },
    )
    .await?;
    info!("Secret {} updated", name);
    Ok(())
}

/// Cluster and provider configuration with discovery data
pub async fn get_cluster_config_data(
    client: &Client,
    cancel: &CancellationToken,
) -> Result<ClusterConfigData> {
    let cluster_config = read_config_secret(client, ConfigSecret::Cluster, cancel)
        .await?
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            Error::state_missing(format!(
                "secret {}/{} has no {}",
                KUBE_SYSTEM_NAMESPACE, CLUSTER_CONFIG_SECRET, CLUSTER_CONFIG_KEY
            ))
        })?;

    let api = secrets(client);
    let provider = retry_loop(
        &RetryConfig::state_reads(),
        &format!("Get {} Secret", PROVIDER_CONFIG_SECRET),
        cancel,
        || async { Ok(api.get_opt(PROVIDER_CONFIG_SECRET).await?) },
    )
    .await?;

    let (provider_cluster_config, cloud_discovery) = match provider {
        Some(s) => (
            secret_value(&s, PROVIDER_CONFIG_KEY),
            secret_value(&s, CLOUD_DISCOVERY_KEY),
        ),
        None => (Vec::new(), Vec::new()),
    };

    Ok(ClusterConfigData {
        cluster_config,
        provider_cluster_config,
        cloud_discovery,
    })
}

/// Parse the configuration stored in the cluster
pub async fn get_meta_config(
    client: &Client,
    store: &SchemaStore,
    cancel: &CancellationToken,
) -> Result<MetaConfig> {
    let data = get_cluster_config_data(client, cancel).await?;
    let cluster = String::from_utf8(data.cluster_config)
        .map_err(|e| Error::config_invalid_in("ClusterConfiguration", e.to_string()))?;
    let provider = String::from_utf8(data.provider_cluster_config)
        .map_err(|e| Error::config_invalid_in("ProviderClusterConfiguration", e.to_string()))?;
    parse_config_from_cluster(&cluster, Some(&provider), store)
}
