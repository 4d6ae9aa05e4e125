//! Local port forwards over SSH with a restart watchdog

use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use candictl_common::{Error, Result};

use crate::client::SshClient;

const STARTUP_PROBES: u32 = 30;
const STARTUP_PROBE_INTERVAL: Duration = Duration::from_millis(500);
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(30);

/// `local_port:remote_host:remote_port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    /// Port on 127.0.0.1
    pub local_port: u16,
    /// Host as seen from the SSH target
    pub remote_host: String,
    /// Port on the remote host
    pub remote_port: u16,
}

impl TunnelSpec {
    /// Forward `local_port` to `remote_host:remote_port`
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.local_port, self.remote_host, self.remote_port)
    }
}

/// A running forward. Dropping it stops the watchdog and the ssh process.
pub struct Tunnel {
    spec: TunnelSpec,
    stop: CancellationToken,
    restart_count: Arc<AtomicU64>,
    watchdog: Option<JoinHandle<()>>,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("spec", &self.spec.to_string())
            .field("restarts", &self.restart_count())
            .finish()
    }
}

impl Tunnel {
    /// Bring the forward up and start its watchdog
    pub async fn start(client: SshClient, spec: TunnelSpec) -> Result<Self> {
        let child = bring_up(&client, &spec).await?;
        info!("[Tunnel] {} is up", spec);

        let stop = client.cancellation_token().child_token();
        let restart_count = Arc::new(AtomicU64::new(0));
        let watchdog = tokio::spawn(watchdog_loop(
            child,
            client,
            spec.clone(),
            stop.clone(),
            restart_count.clone(),
        ));

        Ok(Self {
            spec,
            stop,
            restart_count,
            watchdog: Some(watchdog),
        })
    }

    /// Forward description
    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    /// How many times the forward was restarted
    pub fn restart_count(&self) -> u64 {
        self.restart_count.load(Ordering::Relaxed)
    }

    /// Stop the watchdog and the ssh process
    pub async fn stop(&mut self) {
        self.stop.cancel();
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.await;
        }
        debug!("[Tunnel] {} stopped", self.spec);
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn spawn_forward(client: &SshClient, spec: &TunnelSpec) -> Result<Child> {
    let settings = client.settings();
    let mut cmd = Command::new("ssh");
    cmd.args(settings.ssh_args())
        .args(["-N", "-o", "ExitOnForwardFailure=yes", "-L"])
        .arg(spec.to_string())
        .arg(settings.target())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(sock) = client.auth_sock() {
        cmd.env("SSH_AUTH_SOCK", sock);
    }
    cmd.spawn().map_err(|e| {
        Error::ssh_unavailable(&settings.host, format!("failed to start tunnel: {}", e))
    })
}

/// Spawn ssh and wait until the local port accepts connections
async fn bring_up(client: &SshClient, spec: &TunnelSpec) -> Result<Child> {
    let mut child = spawn_forward(client, spec)?;
    let addr = ("127.0.0.1", spec.local_port);

    for _ in 0..STARTUP_PROBES {
        if let Some(status) = child.try_wait()? {
            let stderr = read_stderr(&mut child).await;
            return Err(Error::ssh_unavailable(
                client.settings().host,
                format!("tunnel {} exited with {}: {}", spec, status, stderr.trim_end()),
            ));
        }
        if TcpStream::connect(addr).await.is_ok() {
            return Ok(child);
        }
        tokio::time::sleep(STARTUP_PROBE_INTERVAL).await;
    }

    let _ = child.kill().await;
    Err(Error::ssh_unavailable(
        client.settings().host,
        format!("tunnel {} did not come up", spec),
    ))
}

async fn read_stderr(child: &mut Child) -> String {
    use tokio::io::AsyncReadExt;
    let mut out = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut out).await;
    }
    out
}

async fn watchdog_loop(
    mut child: Child,
    client: SshClient,
    spec: TunnelSpec,
    stop: CancellationToken,
    restart_count: Arc<AtomicU64>,
) {
    loop {
        let status = tokio::select! {
            _ = stop.cancelled() => {
                let _ = child.kill().await;
                return;
            }
            status = child.wait() => status,
        };
        warn!(tunnel = %spec, status = ?status, "[Tunnel] ssh exited, restarting");

        let mut backoff = Duration::from_secs(1);
        child = loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            match bring_up(&client, &spec).await {
                Ok(child) => break child,
                Err(e) => {
                    warn!(tunnel = %spec, error = %e, "[Tunnel] Restart failed");
                    backoff = (backoff * 2).min(MAX_RESTART_BACKOFF);
                }
            }
        };
        restart_count.fetch_add(1, Ordering::Relaxed);
        info!("[Tunnel] {} restarted", spec);
    }
}
