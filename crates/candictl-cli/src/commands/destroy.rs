//! Destroy command

use clap::Args;

use candictl_operations::{ClusterDestroyer, DestroyOptions};
use candictl_terraform::UseStateCache;

use super::{cluster_identity, Context};
use crate::{KubeArgs, Result};

/// Destroy arguments
#[derive(Args, Debug, Clone)]
pub struct DestroyArgs {
    /// Leave in-cluster resources alone and only destroy the infrastructure
    #[arg(long)]
    pub skip_resources: bool,

    /// Start from an empty state cache
    #[arg(long)]
    pub drop_cache: bool,

    /// Reuse states left in the cache: ask, yes or no
    #[arg(long, default_value = "ask")]
    pub use_terraform_state_cache: UseStateCache,

    /// Kubernetes and SSH connection
    #[command(flatten)]
    pub kube: KubeArgs,
}

/// Destroy the cluster; the cache is keyed on how the cluster is reached
pub async fn run(ctx: &Context, args: DestroyArgs) -> Result<()> {
    let schema_store = ctx.schema_store()?;
    let cache = ctx.state_cache(&cluster_identity(&args.kube), args.drop_cache)?;
    let factory = ctx.factory(ctx.runner_settings(args.use_terraform_state_cache), cache);
    let access = ctx.kube_access(&args.kube).await?;

    let options = DestroyOptions {
        skip_resources: args.skip_resources,
        auto_approve: ctx.auto_approve(),
    };
    ClusterDestroyer::new(
        access,
        factory,
        ctx.teardown.clone(),
        ctx.prompter.clone(),
        schema_store,
        options,
    )
    .run()
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn test_destroy_args() {
        let cli = Cli::try_parse_from([
            "candictl",
            "destroy",
            "--ssh-host",
            "1.2.3.4",
            "--skip-resources",
            "--use-terraform-state-cache",
            "no",
        ])
        .unwrap();
        let Commands::Destroy(args) = cli.command else {
            panic!("expected destroy");
        };
        assert!(args.skip_resources);
        assert!(!args.drop_cache);
        assert_eq!(args.use_terraform_state_cache, UseStateCache::No);
        assert_eq!(cluster_identity(&args.kube), "ubuntu@1.2.3.4");
    }
}
