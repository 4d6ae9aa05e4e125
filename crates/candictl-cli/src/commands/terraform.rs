//! Infrastructure drift: one-shot check and the Prometheus exporter

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use kube::Client;

use candictl_config::SchemaStore;
use candictl_kube::{KubeNodeGroups, KubeStateStore};
use candictl_operations::exporter::{StatisticsSource, DEFAULT_LISTEN_ADDRESS, DEFAULT_METRICS_PATH};
use candictl_operations::{
    check_state, cluster_meta_config, run_exporter, ClusterStatisticsSource, ExporterConfig,
    OutputFormat, TerraformInfraChecker,
};
use candictl_terraform::UseStateCache;

use super::{parse_duration, Context};
use crate::{KubeArgs, Result};

/// Terraform subcommands
#[derive(Subcommand, Debug)]
pub enum TerraformCommand {
    /// Compare the infrastructure with the configuration and print the result
    Check(CheckArgs),
    /// Serve check results as Prometheus metrics
    ConvergeExporter(ExporterArgs),
}

/// Check arguments
#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    /// Output format: yaml or json
    #[arg(long, short = 'o', default_value = "yaml")]
    pub output: OutputFormat,

    /// Kubernetes and SSH connection
    #[command(flatten)]
    pub kube: KubeArgs,
}

/// Exporter arguments
#[derive(Args, Debug, Clone)]
pub struct ExporterArgs {
    /// Address to listen on
    #[arg(long, default_value = DEFAULT_LISTEN_ADDRESS)]
    pub listen_address: SocketAddr,

    /// Path serving the metrics
    #[arg(long, default_value = DEFAULT_METRICS_PATH)]
    pub metrics_path: String,

    /// Time between checks, e.g. 60s or 5m
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    pub check_interval: Duration,

    /// Kubernetes and SSH connection
    #[command(flatten)]
    pub kube: KubeArgs,
}

/// Run a terraform subcommand
pub async fn run(ctx: &Context, cmd: TerraformCommand) -> Result<()> {
    let schema_store = ctx.schema_store()?;
    let kube = match &cmd {
        TerraformCommand::Check(args) => &args.kube,
        TerraformCommand::ConvergeExporter(args) => &args.kube,
    };
    let mut session = ctx.kube_session(kube).await?;
    let client = session.client();

    let result = match cmd {
        TerraformCommand::Check(args) => check(ctx, client, schema_store, args.output).await,
        TerraformCommand::ConvergeExporter(args) => exporter(ctx, client, schema_store, args).await,
    };
    session.stop().await;
    result
}

async fn check(
    ctx: &Context,
    client: Client,
    schema_store: Arc<SchemaStore>,
    output: OutputFormat,
) -> Result<()> {
    let cancel = ctx.teardown.cancellation_token();
    let store = KubeStateStore::new(client.clone(), cancel.clone());
    let meta = Arc::new(cluster_meta_config(&client, &store, &schema_store, &cancel).await?);
    let node_groups = KubeNodeGroups::new(client, cancel);

    let cache = ctx.scratch_cache("check")?;
    let factory = ctx.factory(ctx.runner_settings(UseStateCache::No), cache);
    let checker = TerraformInfraChecker::new(meta.clone(), factory);

    let statistics = check_state(&meta, &store, &node_groups, &checker).await?;
    println!("{}", statistics.render(output)?);
    Ok(())
}

async fn exporter(
    ctx: &Context,
    client: Client,
    schema_store: Arc<SchemaStore>,
    args: ExporterArgs,
) -> Result<()> {
    let scratch_dir = ctx.scratch_dir("converge-exporter");
    let cache = ctx.scratch_cache("converge-exporter")?;
    let factory = ctx.factory(ctx.runner_settings(UseStateCache::No), cache);
    let cancel = ctx.teardown.cancellation_token();

    let source: Arc<dyn StatisticsSource> = Arc::new(ClusterStatisticsSource::new(
        client,
        factory,
        schema_store,
        cancel.clone(),
        scratch_dir,
    ));
    let config = ExporterConfig::new(args.listen_address, &args.metrics_path, args.check_interval);
    run_exporter(config, source, cancel).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cli, Commands};
    use clap::Parser;

    fn terraform(argv: &[&str]) -> TerraformCommand {
        let mut full = vec!["candictl", "terraform"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Commands::Terraform(cmd) => cmd,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_check_output_format() {
        let TerraformCommand::Check(args) = terraform(&["check"]) else {
            panic!("expected check");
        };
        assert_eq!(args.output, OutputFormat::Yaml);

        let TerraformCommand::Check(args) = terraform(&["check", "-o", "json"]) else {
            panic!("expected check");
        };
        assert_eq!(args.output, OutputFormat::Json);

        assert!(Cli::try_parse_from(["candictl", "terraform", "check", "-o", "xml"]).is_err());
    }

    #[test]
    fn test_exporter_defaults() {
        let TerraformCommand::ConvergeExporter(args) = terraform(&["converge-exporter"]) else {
            panic!("expected exporter");
        };
        assert_eq!(args.listen_address, "127.0.0.1:9101".parse::<SocketAddr>().unwrap());
        assert_eq!(args.metrics_path, "/metrics");
        assert_eq!(args.check_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_exporter_flags() {
        let TerraformCommand::ConvergeExporter(args) = terraform(&[
            "converge-exporter",
            "--listen-address",
            "0.0.0.0:9200",
            "--metrics-path",
            "stats",
            "--check-interval",
            "5m",
        ]) else {
            panic!("expected exporter");
        };
        assert_eq!(args.listen_address.port(), 9200);
        assert_eq!(args.check_interval, Duration::from_secs(300));
        let config = ExporterConfig::new(args.listen_address, &args.metrics_path, args.check_interval);
        assert_eq!(config.metrics_path, "/stats");
    }
}
