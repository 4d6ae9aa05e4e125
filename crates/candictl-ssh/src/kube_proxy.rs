//! Kubernetes API access through `kubectl proxy` on the master
//!
//! The proxy is started remotely with `--port=0`; the port it picked is read
//! from its `Starting to serve on ...:<port>` line. A local tunnel is then
//! opened to that port. On the first start successive local ports are tried
//! when one is busy. If the remote proxy exits, a watchdog relaunches it and
//! re-opens the tunnel on the same local port.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use candictl_common::{Error, Result};

use crate::client::SshClient;
use crate::tunnel::{Tunnel, TunnelSpec};

/// First local port tried for the tunnel
pub const DEFAULT_LOCAL_PORT: u16 = 22322;

const LOCAL_PORT_RETRIES: u16 = 12;
const SERVE_LINE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(30);
const SERVE_MARKER: &str = "Starting to serve on";

/// Port from a `Starting to serve on 127.0.0.1:38211` line
pub fn parse_serve_port(line: &str) -> Option<u16> {
    let (_, rest) = line.split_once(SERVE_MARKER)?;
    let (_, port) = rest.trim().rsplit_once(':')?;
    port.trim().parse().ok()
}

struct Session {
    proxy: JoinHandle<()>,
    proxy_stop: CancellationToken,
    tunnel: Tunnel,
}

impl Session {
    async fn shutdown(mut self) {
        self.proxy_stop.cancel();
        self.tunnel.stop().await;
        let _ = self.proxy.await;
    }
}

/// A running kube API proxy reachable at `127.0.0.1:<local_port>`
pub struct KubeProxy {
    local_port: u16,
    stop: CancellationToken,
    restart_count: Arc<AtomicU64>,
    watchdog: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for KubeProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeProxy")
            .field("local_port", &self.local_port)
            .field("restarts", &self.restart_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl KubeProxy {
    /// Start the remote proxy and the local tunnel
    pub async fn start(client: SshClient) -> Result<Self> {
        let stop = client.cancellation_token().child_token();

        let mut last_err = None;
        let mut started = None;
        for offset in 0..LOCAL_PORT_RETRIES {
            let port = DEFAULT_LOCAL_PORT + offset;
            match start_session(&client, port, &stop).await {
                Ok(session) => {
                    started = Some((port, session));
                    break;
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    warn!(local_port = port, error = %e, "[KubeProxy] Start failed, trying next port");
                    last_err = Some(e);
                }
            }
        }
        let Some((local_port, session)) = started else {
            return Err(Error::proxy_failed(format!(
                "kube proxy did not start after {} attempts: {}",
                LOCAL_PORT_RETRIES,
                last_err.map(|e| e.to_string()).unwrap_or_default()
            )));
        };
        info!("[KubeProxy] Kubernetes API is available on 127.0.0.1:{}", local_port);

        let restart_count = Arc::new(AtomicU64::new(0));
        let watchdog = tokio::spawn(watchdog_loop(
            session,
            client,
            local_port,
            stop.clone(),
            restart_count.clone(),
        ));

        Ok(Self {
            local_port,
            stop,
            restart_count,
            watchdog: Some(watchdog),
        })
    }

    /// Local port of the API
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// How many times the remote proxy was relaunched
    pub fn restart_count(&self) -> u64 {
        self.restart_count.load(Ordering::Relaxed)
    }

    /// Stop the proxy and the tunnel
    pub async fn stop(&mut self) {
        self.stop.cancel();
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.await;
        }
        info!("[KubeProxy] Stopped");
    }
}

impl Drop for KubeProxy {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn start_session(
    client: &SshClient,
    local_port: u16,
    stop: &CancellationToken,
) -> Result<Session> {
    let (tx, mut rx) = mpsc::channel(16);
    let proxy_stop = stop.child_token();
    let cmd = client
        .command(
            "kubectl",
            &[
                "proxy",
                "--port=0",
                "--kubeconfig",
                "/etc/kubernetes/admin.conf",
            ],
        )
        .sudo()
        .with_stdout_lines(tx);

    let token = proxy_stop.clone();
    let proxy = tokio::spawn(async move {
        match cmd.run(&token).await {
            Ok(out) => debug!(code = ?out.code, "[KubeProxy] kubectl proxy exited"),
            Err(e) => debug!(error = %e, "[KubeProxy] kubectl proxy failed"),
        }
    });

    let remote_port = tokio::time::timeout(SERVE_LINE_TIMEOUT, async {
        while let Some(line) = rx.recv().await {
            debug!("[KubeProxy] {}", line);
            if let Some(port) = parse_serve_port(&line) {
                return Some(port);
            }
        }
        None
    })
    .await;

    let remote_port = match remote_port {
        Ok(Some(port)) => port,
        Ok(None) => {
            proxy_stop.cancel();
            let _ = proxy.await;
            return Err(Error::proxy_failed("kubectl proxy exited before serving"));
        }
        Err(_) => {
            proxy_stop.cancel();
            let _ = proxy.await;
            return Err(Error::proxy_failed("timeout waiting for kubectl proxy to start"));
        }
    };
    // keep draining so the proxy never blocks on a full channel
    tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let spec = TunnelSpec::new(local_port, "localhost", remote_port);
    match client.tunnel(spec).await {
        Ok(tunnel) => Ok(Session {
            proxy,
            proxy_stop,
            tunnel,
        }),
        Err(e) => {
            proxy_stop.cancel();
            let _ = proxy.await;
            Err(e)
        }
    }
}

async fn watchdog_loop(
    mut session: Session,
    client: SshClient,
    local_port: u16,
    stop: CancellationToken,
    restart_count: Arc<AtomicU64>,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                session.shutdown().await;
                return;
            }
            _ = &mut session.proxy => {}
        }
        warn!("[KubeProxy] kubectl proxy exited unexpectedly, restarting");
        session.proxy_stop.cancel();
        session.tunnel.stop().await;

        let mut backoff = Duration::from_secs(1);
        session = loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            match start_session(&client, local_port, &stop).await {
                Ok(next) => break next,
                Err(e) => {
                    warn!(error = %e, "[KubeProxy] Restart failed");
                    backoff = (backoff * 2).min(MAX_RESTART_BACKOFF);
                }
            }
        };
        restart_count.fetch_add(1, Ordering::Relaxed);
    }
}
