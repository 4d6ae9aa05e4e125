//! candictl command line
//!
//! Every subcommand builds a [`commands::Context`] from the global flags, runs
//! one driver from `candictl-operations` and tears the process down through
//! the shared registry, whether it succeeded or was interrupted.

#![deny(missing_docs)]

pub mod commands;
pub mod error;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::warn;

use candictl_common::logging::LoggerType;
use candictl_common::DEFAULT_TMP_DIR;
use candictl_config::{DEFAULT_PROVIDERS_DIR, DEFAULT_SCHEMA_DIR};
use candictl_ssh::settings::expand_home;
use candictl_ssh::SshSettings;

pub use error::{Error, Result};

/// candictl - cluster lifecycle for Deckhouse
#[derive(Parser, Debug)]
#[command(name = "candictl")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Flags shared by every command
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Command to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Directory for state caches and runner files
    #[arg(long, global = true, env = "CANDICTL_TMP_DIR", default_value = DEFAULT_TMP_DIR)]
    pub tmp_dir: PathBuf,

    /// Log output style: pretty, simple or json
    #[arg(long, global = true, default_value = "pretty")]
    pub logger_type: LoggerType,

    /// Answer yes to every confirmation
    #[arg(long = "yes-i-am-sane-and-i-understand-what-i-am-doing", global = true)]
    pub sanity_check: bool,

    /// Root of the cloud provider layouts
    #[arg(long, global = true, default_value = DEFAULT_PROVIDERS_DIR)]
    pub providers_dir: PathBuf,

    /// Directory of the configuration schemas
    #[arg(long, global = true, default_value = DEFAULT_SCHEMA_DIR)]
    pub schema_dir: PathBuf,
}

/// How to reach the master over SSH
#[derive(Args, Debug, Clone)]
pub struct SshArgs {
    /// Master address
    #[arg(long)]
    pub ssh_host: Option<String>,

    /// Login user
    #[arg(long, default_value = "ubuntu")]
    pub ssh_user: String,

    /// SSH port
    #[arg(long)]
    pub ssh_port: Option<u16>,

    /// Private keys to load into the agent, comma separated
    #[arg(long, value_delimiter = ',')]
    pub ssh_agent_private_keys: Vec<PathBuf>,

    /// Jump host
    #[arg(long)]
    pub ssh_bastion_host: Option<String>,

    /// Jump host user
    #[arg(long)]
    pub ssh_bastion_user: Option<String>,

    /// Jump host port
    #[arg(long)]
    pub ssh_bastion_port: Option<u16>,

    /// Extra ssh options, comma separated
    #[arg(long)]
    pub ssh_extra_args: Option<String>,
}

impl SshArgs {
    /// Connection settings; key paths have `~` expanded
    pub fn settings(&self) -> SshSettings {
        SshSettings {
            host: self.ssh_host.clone().unwrap_or_default(),
            user: self.ssh_user.clone(),
            port: self.ssh_port,
            private_keys: self
                .ssh_agent_private_keys
                .iter()
                .map(|p| expand_home(p))
                .collect(),
            bastion_host: self.ssh_bastion_host.clone(),
            bastion_user: self.ssh_bastion_user.clone(),
            bastion_port: self.ssh_bastion_port,
            extra_args: self.ssh_extra_args.clone(),
            become_pass: None,
        }
    }
}

/// How to reach the Kubernetes API of a running cluster
#[derive(Args, Debug, Clone)]
pub struct KubeArgs {
    /// Connect with this kubeconfig instead of the SSH kube proxy
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// SSH connection used when no kubeconfig is given
    #[command(flatten)]
    pub ssh: SshArgs,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a cluster from scratch
    Bootstrap(commands::bootstrap::BootstrapArgs),

    /// Run a single bootstrap phase
    #[command(subcommand)]
    BootstrapPhase(commands::bootstrap::PhaseCommand),

    /// Reconcile the infrastructure of a running cluster with its configuration
    Converge(commands::converge::ConvergeArgs),

    /// Destroy a cluster and its infrastructure
    Destroy(commands::destroy::DestroyArgs),

    /// Inspect infrastructure drift
    #[command(subcommand)]
    Terraform(commands::terraform::TerraformCommand),

    /// Work with configuration documents
    #[command(subcommand)]
    Config(commands::config::ConfigCommand),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let ctx = commands::Context::new(self.global);

        let listener = ctx.teardown.clone();
        let signals = tokio::spawn(async move {
            if let Err(e) = listener.wait_for_interrupt().await {
                warn!(error = %e, "Unable to listen for signals");
            }
        });

        let result = match self.command {
            Commands::Bootstrap(args) => commands::bootstrap::run(&ctx, args).await,
            Commands::BootstrapPhase(cmd) => commands::bootstrap::run_phase(&ctx, cmd).await,
            Commands::Converge(args) => commands::converge::run(&ctx, args).await,
            Commands::Destroy(args) => commands::destroy::run(&ctx, args).await,
            Commands::Terraform(cmd) => commands::terraform::run(&ctx, cmd).await,
            Commands::Config(cmd) => commands::config::run(&ctx, cmd).await,
        };

        ctx.teardown.shutdown();
        signals.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "candictl",
            "converge",
            "--tmp-dir",
            "/var/tmp/c",
            "--logger-type",
            "json",
            "--yes-i-am-sane-and-i-understand-what-i-am-doing",
        ])
        .unwrap();
        assert_eq!(cli.global.tmp_dir, PathBuf::from("/var/tmp/c"));
        assert_eq!(cli.global.logger_type, LoggerType::Json);
        assert!(cli.global.sanity_check);
    }

    #[test]
    fn test_unknown_logger_type_rejected() {
        let err = Cli::try_parse_from(["candictl", "--logger-type", "fancy", "converge"]);
        assert!(err.is_err());
    }

    #[test]
    fn test_ssh_settings_from_flags() {
        let cli = Cli::try_parse_from([
            "candictl",
            "destroy",
            "--ssh-host",
            "10.0.0.1",
            "--ssh-user",
            "admin",
            "--ssh-port",
            "2222",
            "--ssh-agent-private-keys",
            "/keys/a,/keys/b",
            "--ssh-bastion-host",
            "bastion",
        ])
        .unwrap();
        let Commands::Destroy(args) = cli.command else {
            panic!("expected destroy");
        };
        let settings = args.kube.ssh.settings();
        assert_eq!(settings.host, "10.0.0.1");
        assert_eq!(settings.user, "admin");
        assert_eq!(settings.port, Some(2222));
        assert_eq!(
            settings.private_keys,
            vec![PathBuf::from("/keys/a"), PathBuf::from("/keys/b")]
        );
        assert_eq!(settings.bastion_host.as_deref(), Some("bastion"));
        assert_eq!(settings.destination(), "admin@10.0.0.1:2222");
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["candictl", "converge"]).unwrap();
        assert_eq!(cli.global.providers_dir, PathBuf::from(DEFAULT_PROVIDERS_DIR));
        assert_eq!(cli.global.schema_dir, PathBuf::from(DEFAULT_SCHEMA_DIR));
        assert_eq!(cli.global.logger_type, LoggerType::Pretty);
        assert!(!cli.global.sanity_check);
        let Commands::Converge(args) = cli.command else {
            panic!("expected converge");
        };
        assert_eq!(args.kube.ssh.ssh_user, "ubuntu");
        assert!(args.kube.kubeconfig.is_none());
    }
}
