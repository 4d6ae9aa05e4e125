//! Multi-document YAML parsing into a [`MetaConfig`]

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use candictl_common::{Error, Result};

use crate::meta::{MetaConfig, RawDocument};
use crate::schema::SchemaStore;

/// Split a multi-document YAML string into JSON values, skipping empty documents
pub fn split_yaml_documents(data: &str) -> Result<Vec<Value>> {
    let mut docs = Vec::new();
    for (i, document) in serde_yaml::Deserializer::from_str(data).enumerate() {
        let value = Value::deserialize(document).map_err(|e| {
            Error::serialization_for(format!("document {}", i + 1), e.to_string())
        })?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

/// Parse configuration documents from a file
pub fn parse_config(path: &Path, store: &SchemaStore) -> Result<MetaConfig> {
    let data = fs::read_to_string(path).map_err(|e| {
        Error::config_invalid(format!("unable to read {}: {}", path.display(), e))
    })?;
    parse_config_from_data(&data, store)
}

/// Parse configuration documents from a string.
///
/// Every document is validated against the schema store, then routed by kind.
pub fn parse_config_from_data(data: &str, store: &SchemaStore) -> Result<MetaConfig> {
    let mut meta = MetaConfig::default();

    for doc in split_yaml_documents(data)? {
        let index = store.validate(&doc)?;
        let raw: RawDocument = serde_json::from_value(doc).map_err(|e| {
            Error::config_invalid_in(index.to_string(), format!("expected a mapping: {}", e))
        })?;

        let slot = match index.kind.as_str() {
            "ClusterConfiguration" => &mut meta.cluster_config,
            "InitConfiguration" => &mut meta.init_cluster_config,
            "StaticClusterConfiguration" => &mut meta.static_cluster_config,
            kind if kind.ends_with("ClusterConfiguration") => &mut meta.provider_cluster_config,
            _ => {
                return Err(Error::config_invalid_in(
                    index.to_string(),
                    "unexpected document in cluster configuration",
                ))
            }
        };
        if !slot.is_empty() {
            return Err(Error::config_invalid_in(
                index.to_string(),
                "document is specified more than once",
            ));
        }
        debug!(document = %index, "Configuration document parsed");
        *slot = raw;
    }

    meta.prepare()
}

/// Parse the configuration stored in the cluster: the cluster document and,
/// for Cloud clusters, the provider document.
pub fn parse_config_from_cluster(
    cluster_config_yaml: &str,
    provider_config_yaml: Option<&str>,
    store: &SchemaStore,
) -> Result<MetaConfig> {
    let mut data = cluster_config_yaml.to_string();
    if let Some(provider) = provider_config_yaml.filter(|p| !p.trim().is_empty()) {
        data.push_str("\n---\n");
        data.push_str(provider);
    }
    parse_config_from_data(&data, store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ClusterType;
    use crate::schema::tests::test_store;

    const CLUSTER: &str = r#"
---
apiVersion: deckhouse.io/v1
kind: ClusterConfiguration
clusterType: Static
kubernetesVersion: "1.16"
podSubnetCIDR: 10.222.0.0/16
serviceSubnetCIDR: 10.111.0.0/16
"#;

    const INIT: &str = r#"
---
apiVersion: deckhouse.io/v1
kind: InitConfiguration
deckhouse:
  imagesRepo: test
  devBranch: test
"#;

    #[test]
    fn test_parse_static_cluster() {
        let data = format!("{}{}", CLUSTER, INIT);
        let meta = parse_config_from_data(&data, &test_store()).unwrap();

        assert_eq!(meta.cluster_type, Some(ClusterType::Static));
        assert_eq!(meta.cluster_dns_address, "10.111.0.10");
        assert_eq!(meta.deckhouse_config.images_repo, "test");
        assert_eq!(meta.deckhouse_config.dev_branch, "test");
        assert_eq!(meta.static_cluster_config_yaml().unwrap().len(), 0);
        assert_eq!(meta.provider_cluster_config_yaml().unwrap().len(), 0);
        assert!(meta
            .cluster_config_yaml()
            .unwrap()
            .contains("kind: ClusterConfiguration"));
    }

    #[test]
    fn test_parse_with_static_document() {
        let data = format!(
            "{}{}---\napiVersion: deckhouse.io/v1\nkind: StaticClusterConfiguration\ninternalNetworkCIDRs:\n- 192.168.0.0/24\n",
            CLUSTER, INIT
        );
        let meta = parse_config_from_data(&data, &test_store()).unwrap();
        assert!(meta
            .static_cluster_config_yaml()
            .unwrap()
            .contains("192.168.0.0/24"));
    }

    #[test]
    fn test_invalid_document_fails() {
        let data = CLUSTER.replace("clusterType: Static", "clusterType: Unknown");
        let err = parse_config_from_data(&data, &test_store()).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn test_duplicate_document_fails() {
        let data = format!("{}{}", CLUSTER, CLUSTER);
        let err = parse_config_from_data(&data, &test_store()).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_split_skips_empty_documents() {
        let docs = split_yaml_documents("---\n---\na: 1\n---\n").unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn test_parse_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, format!("{}{}", CLUSTER, INIT)).unwrap();
        let meta = parse_config(&path, &test_store()).unwrap();
        assert_eq!(meta.cluster_type, Some(ClusterType::Static));
    }

    #[test]
    fn test_parse_config_from_cluster_without_provider() {
        let meta = parse_config_from_cluster(CLUSTER, Some(""), &test_store()).unwrap();
        assert_eq!(meta.cluster_type, Some(ClusterType::Static));
        assert!(meta.provider_cluster_config.is_empty());
    }
}
