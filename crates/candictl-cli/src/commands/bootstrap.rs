//! Bootstrap command and its individual phases
//!
//! Every phase shares the state cache of the full bootstrap, keyed on the
//! cluster prefix and provider, so phases can be re-run or aborted one by one.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Subcommand};
use tracing::info;

use candictl_config::{parse_config, parse_resources, MetaConfig, SchemaStore};
use candictl_operations::bashible::DEFAULT_BASHIBLE_DIR;
use candictl_operations::bootstrap::ensure_uuid;
use candictl_operations::{abort_bootstrap, BootstrapOptions, Bootstrapper};
use candictl_terraform::{RunnerFactory, UseStateCache};

use super::{require_ssh_host, Context};
use crate::{KubeArgs, Result};

/// Bootstrap arguments
#[derive(Args, Debug, Clone)]
pub struct BootstrapArgs {
    /// Cluster configuration, multi-document YAML
    #[arg(long)]
    pub config: PathBuf,

    /// Resources to create once the platform is running
    #[arg(long)]
    pub resources: Option<PathBuf>,

    /// Start from an empty state cache
    #[arg(long)]
    pub drop_cache: bool,

    /// Reuse states left in the cache: ask, yes or no
    #[arg(long, default_value = "ask")]
    pub use_terraform_state_cache: UseStateCache,

    /// Bashible templates
    #[arg(long, default_value = DEFAULT_BASHIBLE_DIR)]
    pub bashible_dir: PathBuf,

    /// Kubernetes and SSH connection
    #[command(flatten)]
    pub kube: KubeArgs,
}

/// Bootstrap phases
#[derive(Subcommand, Debug)]
pub enum PhaseCommand {
    /// Create the base infrastructure only
    BaseInfra(BootstrapArgs),
    /// Run the bashible bundle on the first master
    ExecuteBashibleBundle(BootstrapArgs),
    /// Install the platform into the running control plane
    InstallDeckhouse(BootstrapArgs),
    /// Create the declarative resources
    CreateResources(BootstrapArgs),
    /// Destroy everything a failed bootstrap left in the cache
    Abort(BootstrapArgs),
}

fn prepare(
    ctx: &Context,
    args: &BootstrapArgs,
) -> Result<(MetaConfig, RunnerFactory, Arc<SchemaStore>)> {
    let store = ctx.schema_store()?;
    let meta = parse_config(&args.config, &store)?;
    let cache = ctx.state_cache(&meta.cache_path(), args.drop_cache)?;
    info!(cache = %cache.dir().display(), "Using state cache");
    let factory = ctx.factory(ctx.runner_settings(args.use_terraform_state_cache), cache);
    Ok((meta, factory, store))
}

async fn bootstrapper(ctx: &Context, args: &BootstrapArgs) -> Result<Bootstrapper> {
    let (meta, factory, store) = prepare(ctx, args)?;
    if !meta.is_cloud() {
        require_ssh_host(&args.kube.ssh)?;
    }
    let resources = match &args.resources {
        Some(path) => parse_resources(path)?,
        None => Vec::new(),
    };
    let options = BootstrapOptions {
        resources,
        kubeconfig: args.kube.kubeconfig.clone(),
        bashible_dir: args.bashible_dir.clone(),
        auto_approve: ctx.auto_approve(),
        ..Default::default()
    };
    let ssh = ctx.ssh_client(&args.kube.ssh).await?;
    let bootstrapper = Bootstrapper::new(meta, ssh, factory, ctx.teardown.clone(), options)?;
    Ok(bootstrapper.with_schema_store(store))
}

/// Run the full bootstrap
pub async fn run(ctx: &Context, args: BootstrapArgs) -> Result<()> {
    bootstrapper(ctx, &args).await?.run().await?;
    Ok(())
}

/// Run a single phase
pub async fn run_phase(ctx: &Context, cmd: PhaseCommand) -> Result<()> {
    match cmd {
        PhaseCommand::BaseInfra(args) => {
            let outputs = bootstrapper(ctx, &args).await?.base_infra().await?;
            info!(
                discovery_bytes = outputs.cloud_discovery.len(),
                "[Phase] Base infrastructure is ready"
            );
        }
        PhaseCommand::ExecuteBashibleBundle(args) => {
            bootstrapper(ctx, &args).await?.execute_bashible_bundle().await?;
        }
        PhaseCommand::InstallDeckhouse(args) => {
            bootstrapper(ctx, &args).await?.install_deckhouse().await?;
        }
        PhaseCommand::CreateResources(args) => {
            bootstrapper(ctx, &args).await?.create_resources().await?;
        }
        PhaseCommand::Abort(args) => abort(ctx, &args).await?,
    }
    Ok(())
}

async fn abort(ctx: &Context, args: &BootstrapArgs) -> Result<()> {
    let (mut meta, factory, _) = prepare(ctx, args)?;
    meta.uuid = ensure_uuid(factory.cache())?;
    abort_bootstrap(Arc::new(meta), factory, ctx.auto_approve()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn test_bootstrap_args() {
        let cli = Cli::try_parse_from([
            "candictl",
            "bootstrap",
            "--config",
            "/cfg/config.yaml",
            "--resources",
            "/cfg/resources.yaml",
            "--drop-cache",
            "--use-terraform-state-cache",
            "yes",
        ])
        .unwrap();
        let Commands::Bootstrap(args) = cli.command else {
            panic!("expected bootstrap");
        };
        assert_eq!(args.config, PathBuf::from("/cfg/config.yaml"));
        assert_eq!(args.resources, Some(PathBuf::from("/cfg/resources.yaml")));
        assert!(args.drop_cache);
        assert_eq!(args.use_terraform_state_cache, UseStateCache::Yes);
        assert_eq!(args.bashible_dir, PathBuf::from(DEFAULT_BASHIBLE_DIR));
    }

    #[test]
    fn test_config_is_required() {
        assert!(Cli::try_parse_from(["candictl", "bootstrap"]).is_err());
    }

    #[test]
    fn test_phase_subcommands() {
        for phase in [
            "base-infra",
            "execute-bashible-bundle",
            "install-deckhouse",
            "create-resources",
            "abort",
        ] {
            let cli = Cli::try_parse_from([
                "candictl",
                "bootstrap-phase",
                phase,
                "--config",
                "c.yaml",
            ])
            .unwrap();
            assert!(matches!(cli.command, Commands::BootstrapPhase(_)), "{}", phase);
        }
    }

    #[test]
    fn test_bad_state_cache_policy() {
        let parsed = Cli::try_parse_from([
            "candictl",
            "bootstrap",
            "--config",
            "c.yaml",
            "--use-terraform-state-cache",
            "maybe",
        ]);
        assert!(parsed.is_err());
    }
}
