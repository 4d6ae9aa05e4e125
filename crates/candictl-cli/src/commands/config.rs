//! Configuration commands: parse, render and edit in place

use std::io::Write;
use std::path::PathBuf;

use clap::{Args, Subcommand};
use kube::Client;
use serde_json::{json, Value};
use tracing::info;

use candictl_config::parse::parse_config_from_cluster;
use candictl_config::{parse_config, MetaConfig, SchemaStore};
use candictl_kube::cluster_config::{read_config_secret, write_config_secret};
use candictl_kube::ConfigSecret;

use super::Context;
use crate::{Error, KubeArgs, Result};

const DEFAULT_EDITOR: &str = "vim";

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration documents and print the parsed result as JSON
    Parse(ParseArgs),
    /// Render values derived from the configuration
    #[command(subcommand)]
    Render(RenderCommand),
    /// Edit a configuration document stored in the cluster
    #[command(subcommand)]
    Edit(EditCommand),
}

/// Parse arguments
#[derive(Args, Debug, Clone)]
pub struct ParseArgs {
    /// Configuration file, multi-document YAML
    #[arg(long)]
    pub config: PathBuf,
}

/// Render subcommands
#[derive(Subcommand, Debug)]
pub enum RenderCommand {
    /// Values passed to the bashible bundle templates
    BashibleBundleValues(RenderArgs),
}

/// Render arguments
#[derive(Args, Debug, Clone)]
pub struct RenderArgs {
    /// Configuration file, multi-document YAML
    #[arg(long)]
    pub config: PathBuf,

    /// Bundle name, defaults to the one in the configuration
    #[arg(long)]
    pub bundle: Option<String>,

    /// Internal address of the node
    #[arg(long)]
    pub node_ip: Option<String>,
}

/// Edit subcommands
#[derive(Subcommand, Debug)]
pub enum EditCommand {
    /// ClusterConfiguration
    ClusterConfiguration(EditArgs),
    /// <Provider>ClusterConfiguration
    ProviderClusterConfiguration(EditArgs),
}

/// Edit arguments
#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    /// Kubernetes and SSH connection
    #[command(flatten)]
    pub kube: KubeArgs,
}

/// Run a config subcommand
pub async fn run(ctx: &Context, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Parse(args) => {
            let meta = parse_config(&args.config, &*ctx.schema_store()?)?;
            println!("{}", serde_json::to_string_pretty(&meta_summary(&meta)?)?);
            Ok(())
        }
        ConfigCommand::Render(RenderCommand::BashibleBundleValues(args)) => {
            let meta = parse_config(&args.config, &*ctx.schema_store()?)?;
            let values = bashible_bundle_values(&meta, &args);
            print!("{}", serde_yaml::to_string(&values)?);
            Ok(())
        }
        ConfigCommand::Edit(EditCommand::ClusterConfiguration(args)) => {
            edit(ctx, ConfigSecret::Cluster, &args).await
        }
        ConfigCommand::Edit(EditCommand::ProviderClusterConfiguration(args)) => {
            edit(ctx, ConfigSecret::Provider, &args).await
        }
    }
}

/// JSON view of a parsed configuration
pub fn meta_summary(meta: &MetaConfig) -> Result<Value> {
    Ok(json!({
        "clusterType": meta.cluster_type.map(|t| t.as_str()),
        "providerName": meta.provider_name,
        "layout": meta.layout,
        "clusterPrefix": meta.cluster_prefix,
        "clusterDNSAddress": meta.cluster_dns_address,
        "deckhouse": serde_json::to_value(&meta.deckhouse_config)?,
        "masterNodeGroup": serde_json::to_value(&meta.master_node_group_spec)?,
        "nodeGroups": serde_json::to_value(&meta.terra_node_group_specs)?,
        "clusterConfiguration": meta.cluster_config,
        "initConfiguration": meta.init_cluster_config,
        "providerClusterConfiguration": meta.provider_cluster_config,
        "staticClusterConfiguration": meta.static_cluster_config,
    }))
}

fn bashible_bundle_values(meta: &MetaConfig, args: &RenderArgs) -> Value {
    let bundle = args
        .bundle
        .as_deref()
        .unwrap_or(&meta.deckhouse_config.bundle);
    meta.config_for_bashible_bundle(bundle, args.node_ip.as_deref())
}

async fn edit(ctx: &Context, which: ConfigSecret, args: &EditArgs) -> Result<()> {
    let schema_store = ctx.schema_store()?;
    let mut session = ctx.kube_session(&args.kube).await?;
    let result = edit_secret(ctx, &session.client(), &schema_store, which).await;
    session.stop().await;
    result
}

async fn edit_secret(
    ctx: &Context,
    client: &Client,
    schema_store: &SchemaStore,
    which: ConfigSecret,
) -> Result<()> {
    let cancel = ctx.teardown.cancellation_token();
    let cluster = read_config_secret(client, ConfigSecret::Cluster, &cancel)
        .await?
        .ok_or_else(|| Error::validation("cluster configuration Secret not found"))?;
    let provider = read_config_secret(client, ConfigSecret::Provider, &cancel)
        .await?
        .unwrap_or_default();

    let current = match which {
        ConfigSecret::Cluster => &cluster,
        _ => &provider,
    };

    let edited = {
        let _guard = ctx.teardown.non_interruptible();
        open_editor(current).await?
    };
    if edited == *current {
        info!("Configuration is unchanged");
        return Ok(());
    }

    match which {
        ConfigSecret::Cluster => validate_documents(&edited, &provider, schema_store)?,
        _ => validate_documents(&cluster, &edited, schema_store)?,
    };

    write_config_secret(client, which, &edited, &cancel).await?;
    Ok(())
}

/// Check that the pair of documents still forms a valid configuration
pub fn validate_documents(
    cluster: &[u8],
    provider: &[u8],
    schema_store: &SchemaStore,
) -> Result<MetaConfig> {
    let cluster = std::str::from_utf8(cluster)
        .map_err(|e| Error::validation(format!("cluster configuration is not UTF-8: {}", e)))?;
    let provider = std::str::from_utf8(provider)
        .map_err(|e| Error::validation(format!("provider configuration is not UTF-8: {}", e)))?;
    Ok(parse_config_from_cluster(cluster, Some(provider), schema_store)?)
}

async fn open_editor(data: &[u8]) -> Result<Vec<u8>> {
    let editor = std::env::var("EDITOR").unwrap_or_else(|_| DEFAULT_EDITOR.to_string());
    let mut parts = editor.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| Error::validation("EDITOR is empty"))?;

    let mut file = tempfile::Builder::new()
        .prefix("candictl-config-")
        .suffix(".yaml")
        .tempfile()?;
    file.write_all(data)?;
    file.flush()?;

    let status = tokio::process::Command::new(program)
        .args(parts)
        .arg(file.path())
        .status()
        .await?;
    if !status.success() {
        return Err(Error::command_failed(format!(
            "{} exited with {}",
            editor, status
        )));
    }
    Ok(std::fs::read(file.path())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cli, Commands};
    use candictl_config::SchemaIndex;
    use clap::Parser;

    const CLUSTER: &str = r#"
apiVersion: deckhouse.io/v1
kind: ClusterConfiguration
clusterType: Static
kubernetesVersion: "1.16"
podSubnetCIDR: 10.222.0.0/16
serviceSubnetCIDR: 10.111.0.0/16
"#;

    const INIT: &str = r#"
apiVersion: deckhouse.io/v1
kind: InitConfiguration
deckhouse:
  imagesRepo: test
  devBranch: test
  bundle: Default
"#;

    fn permissive_store() -> SchemaStore {
        let mut store = SchemaStore::new();
        for kind in ["ClusterConfiguration", "InitConfiguration"] {
            store.register(
                SchemaIndex::new("deckhouse.io/v1", kind),
                json!({ "type": "object" }),
            );
        }
        store
    }

    fn static_meta() -> MetaConfig {
        let data = format!("{}\n---\n{}", CLUSTER, INIT);
        candictl_config::parse_config_from_data(&data, &permissive_store()).unwrap()
    }

    #[test]
    fn test_meta_summary() {
        let summary = meta_summary(&static_meta()).unwrap();
        assert_eq!(summary["clusterType"], "Static");
        assert_eq!(summary["clusterDNSAddress"], "10.111.0.10");
        assert_eq!(summary["clusterConfiguration"]["kubernetesVersion"], "1.16");
        assert_eq!(summary["providerClusterConfiguration"], json!({}));
    }

    #[test]
    fn test_bundle_flag_overrides_configuration() {
        let meta = static_meta();
        let defaults = RenderArgs {
            config: PathBuf::from("c.yaml"),
            bundle: None,
            node_ip: None,
        };
        assert_eq!(bashible_bundle_values(&meta, &defaults)["bundle"], "Default");

        let overridden = RenderArgs {
            bundle: Some("ubuntu-lts".to_string()),
            ..defaults
        };
        assert_eq!(bashible_bundle_values(&meta, &overridden)["bundle"], "ubuntu-lts");
    }

    #[test]
    fn test_validate_documents() {
        let store = permissive_store();
        let meta = validate_documents(CLUSTER.as_bytes(), b"", &store).unwrap();
        assert_eq!(meta.cluster_dns_address, "10.111.0.10");

        let unknown = b"apiVersion: deckhouse.io/v1\nkind: Mystery\n";
        assert!(validate_documents(unknown, b"", &store).is_err());
        assert!(validate_documents(&[0xff, 0xfe], b"", &store).is_err());
    }

    #[test]
    fn test_edit_subcommands() {
        let cli = Cli::try_parse_from([
            "candictl",
            "config",
            "edit",
            "provider-cluster-configuration",
            "--kubeconfig",
            "/k",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommand::Edit(EditCommand::ProviderClusterConfiguration(_)))
        ));
    }
}
