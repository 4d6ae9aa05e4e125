//! CLI commands

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use candictl_common::cache::{identity_hash, Cache};
use candictl_common::input::{Prompter, TerminalPrompter};
use candictl_common::logging::is_debug;
use candictl_common::teardown::Teardown;
use candictl_config::SchemaStore;
use candictl_operations::{KubeAccess, KubeSession};
use candictl_ssh::SshClient;
use candictl_terraform::{RunnerFactory, RunnerSettings, UseStateCache};

use crate::{Error, GlobalArgs, KubeArgs, Result, SshArgs};

pub mod bootstrap;
pub mod config;
pub mod converge;
pub mod destroy;
pub mod terraform;

/// Process-wide pieces shared by every command
pub struct Context {
    /// Global flags
    pub global: GlobalArgs,
    /// Shutdown hooks and the cancellation token
    pub teardown: Arc<Teardown>,
    /// Confirmations, auto-approved by the sanity flag
    pub prompter: Arc<dyn Prompter>,
}

impl Context {
    /// Context for `global`
    pub fn new(global: GlobalArgs) -> Self {
        let prompter = Arc::new(TerminalPrompter::new(global.sanity_check));
        Self {
            global,
            teardown: Teardown::new(),
            prompter,
        }
    }

    /// Answer every confirmation positively
    pub fn auto_approve(&self) -> bool {
        self.global.sanity_check
    }

    /// Schemas of the cluster documents and of every provider
    pub fn schema_store(&self) -> Result<Arc<SchemaStore>> {
        let store = SchemaStore::from_dirs(&self.global.schema_dir, &self.global.providers_dir)?;
        Ok(Arc::new(store))
    }

    /// Runner settings rooted at the global directories
    pub fn runner_settings(&self, use_state_cache: UseStateCache) -> RunnerSettings {
        RunnerSettings {
            providers_dir: self.global.providers_dir.clone(),
            tmp_dir: self.global.tmp_dir.clone(),
            debug: is_debug(),
            use_state_cache,
            ..Default::default()
        }
    }

    /// Persistent state cache for `identity`.
    ///
    /// With `drop_cache` the directory is removed first, tombstone included.
    pub fn state_cache(&self, identity: &str, drop_cache: bool) -> Result<Arc<Cache>> {
        if drop_cache {
            let dir = self.global.tmp_dir.join(identity_hash(identity));
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => info!(dir = %dir.display(), "State cache dropped"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Arc::new(Cache::open(&self.global.tmp_dir, identity)?))
    }

    /// Cache that keeps nothing between runs
    pub fn scratch_cache(&self, name: &str) -> Result<Arc<Cache>> {
        Ok(Arc::new(Cache::dummy(self.scratch_dir(name))?))
    }

    /// Per-command directory under the temp dir
    pub fn scratch_dir(&self, name: &str) -> PathBuf {
        self.global.tmp_dir.join(name)
    }

    /// Runner factory writing to `cache`
    pub fn factory(&self, settings: RunnerSettings, cache: Arc<Cache>) -> RunnerFactory {
        RunnerFactory::new(
            Arc::new(settings),
            cache,
            self.prompter.clone(),
            self.teardown.clone(),
        )
    }

    /// SSH client whose agent is stopped at teardown
    pub async fn ssh_client(&self, args: &SshArgs) -> Result<SshClient> {
        let client = SshClient::from_config(args.settings(), &self.teardown);
        client.start().await?;
        Ok(client)
    }

    /// Kubeconfig when given, otherwise the SSH kube proxy on `--ssh-host`
    pub async fn kube_access(&self, args: &KubeArgs) -> Result<KubeAccess> {
        if let Some(path) = &args.kubeconfig {
            return Ok(KubeAccess::Kubeconfig(path.clone()));
        }
        require_ssh_host(&args.ssh)?;
        Ok(KubeAccess::Ssh(self.ssh_client(&args.ssh).await?))
    }

    /// Open a Kubernetes session for `args`
    pub async fn kube_session(&self, args: &KubeArgs) -> Result<KubeSession> {
        let access = self.kube_access(args).await?;
        Ok(KubeSession::connect(&access).await?)
    }
}

/// `--ssh-host` is mandatory for commands that reach an existing master
pub fn require_ssh_host(args: &SshArgs) -> Result<()> {
    match args.ssh_host.as_deref() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(Error::validation(
            "--ssh-host is required when --kubeconfig is not given",
        )),
    }
}

/// Identity of the cache of a running cluster
pub fn cluster_identity(args: &KubeArgs) -> String {
    match &args.kubeconfig {
        Some(path) => format!("kubeconfig:{}", path.display()),
        None => args.ssh.settings().destination(),
    }
}

/// Parse "1h", "30m", "45s" or raw seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let invalid = || Error::validation(format!("invalid duration '{}', expected e.g. 1h, 30m, 60s", s));
    let (digits, unit) = if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else if let Some(minutes) = s.strip_suffix('m') {
        (minutes, 60)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else {
        (s, 1)
    };
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(n * unit))
}
