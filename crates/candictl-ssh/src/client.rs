//! SSH client: agent, availability checks, commands and uploads

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use candictl_common::process::{execute, ExecOptions};
use candictl_common::retry::{retry_loop, RetryConfig};
use candictl_common::teardown::Teardown;
use candictl_common::{Error, Result};

use crate::agent::Agent;
use crate::command::SshCommand;
use crate::kube_proxy::KubeProxy;
use crate::tunnel::{Tunnel, TunnelSpec};
use crate::upload::UploadScript;
use crate::settings::SshSettings;

struct Inner {
    settings: RwLock<SshSettings>,
    agent: Mutex<Option<Agent>>,
    auth_sock: RwLock<Option<String>>,
    cancel: CancellationToken,
}

/// Handle to one remote host. Cheap to clone.
#[derive(Clone)]
pub struct SshClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("destination", &self.inner.settings.read().destination())
            .finish()
    }
}

impl SshClient {
    /// Client for `settings`, stopped by `cancel`
    pub fn new(settings: SshSettings, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings: RwLock::new(settings),
                agent: Mutex::new(None),
                auth_sock: RwLock::new(None),
                cancel,
            }),
        }
    }

    /// Client bound to the registry's token; the agent is stopped at teardown
    pub fn from_config(settings: SshSettings, teardown: &Teardown) -> Self {
        let client = Self::new(settings, teardown.cancellation_token());
        let hook = client.clone();
        teardown.register("ssh agent", move || hook.stop());
        client
    }

    /// Spawn the agent and load the private keys
    pub async fn start(&self) -> Result<()> {
        let keys = self.inner.settings.read().private_keys.clone();
        if keys.is_empty() {
            info!("No private keys given, using the caller's ssh-agent");
            return Ok(());
        }
        let agent = Agent::start(&keys, &self.inner.cancel).await?;
        *self.inner.auth_sock.write() = Some(agent.auth_sock().to_string());
        *self.inner.agent.lock() = Some(agent);
        Ok(())
    }

    /// Kill the agent
    pub fn stop(&self) {
        if let Some(mut agent) = self.inner.agent.lock().take() {
            agent.stop();
        }
    }

    /// Snapshot of the settings
    pub fn settings(&self) -> SshSettings {
        self.inner.settings.read().clone()
    }

    /// Point the client at another host
    pub fn set_host(&self, host: impl Into<String>) {
        let host = host.into();
        info!("SSH target changed to {}", host);
        self.inner.settings.write().host = host;
    }

    /// Cancellation token of the client
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub(crate) fn auth_sock(&self) -> Option<String> {
        self.inner.auth_sock.read().clone()
    }

    /// Remote command `name args...`
    pub fn command(&self, name: impl Into<String>, args: &[&str]) -> SshCommand {
        SshCommand::new(
            self.settings(),
            self.auth_sock(),
            name,
            args.iter().map(|s| s.to_string()).collect(),
        )
    }

    /// Availability check
    pub fn check(&self) -> Check {
        Check {
            client: self.clone(),
            delay: Duration::ZERO,
            retry: RetryConfig::new(50, Duration::from_secs(5)),
        }
    }

    /// Script to upload and execute
    pub fn upload_script(&self, path: impl AsRef<Path>, args: &[&str]) -> UploadScript {
        UploadScript::new(self.clone(), path.as_ref(), args)
    }

    /// Copy a local file to the remote host
    pub async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let settings = self.settings();
        let mut cmd = Command::new("scp");
        cmd.args(settings.scp_args())
            .arg(local)
            .arg(format!("{}:{}", settings.target(), remote));
        if let Some(sock) = self.auth_sock() {
            cmd.env("SSH_AUTH_SOCK", sock);
        }
        let out = execute(cmd, &ExecOptions::new("scp"), &self.inner.cancel).await?;
        if out.stopped {
            return Err(Error::loop_cancelled("scp"));
        }
        if !out.success() {
            return Err(Error::ssh_unavailable(
                &settings.host,
                format!(
                    "upload of {} failed: {}",
                    local.display(),
                    out.stderr.trim_end()
                ),
            ));
        }
        Ok(())
    }

    /// Local port forward, restarted when it drops
    pub async fn tunnel(&self, spec: TunnelSpec) -> Result<Tunnel> {
        Tunnel::start(self.clone(), spec).await
    }

    /// `kubectl proxy` on the host, reachable through a local port
    pub async fn kube_proxy(&self) -> Result<KubeProxy> {
        KubeProxy::start(self.clone()).await
    }
}

/// Waits until the host accepts SSH sessions
#[derive(Debug)]
pub struct Check {
    client: SshClient,
    delay: Duration,
    retry: RetryConfig,
}

impl Check {
    /// Wait before the first attempt
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Attempts and interval
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run `echo SUCCESS` until it works
    pub async fn await_availability(&self) -> Result<()> {
        let cancel = self.client.cancellation_token();
        let host = self.client.settings().host;
        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::loop_cancelled("ssh availability")),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        info!("Waiting for SSH connection to {}", host);
        retry_loop(&self.retry, "Waiting for SSH connection", &cancel, || async {
            let out = self
                .client
                .command("echo", &["SUCCESS"])
                .capture_stdout()
                .with_timeout(Duration::from_secs(30))
                .run(&cancel)
                .await?;
            if out.success() && String::from_utf8_lossy(&out.stdout).contains("SUCCESS") {
                Ok(())
            } else {
                warn!(host = %host, code = ?out.code, "SSH is not available yet");
                Err(Error::ssh_unavailable(&host, out.stderr.trim_end()))
            }
        })
        .await?;
        info!("SSH connection to {} established", host);
        Ok(())
    }
}
