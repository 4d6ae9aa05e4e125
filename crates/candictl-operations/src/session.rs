//! Kubernetes connection of a command: a kubeconfig or the SSH kube proxy

use std::path::PathBuf;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use candictl_common::kube_utils::{create_client, create_proxy_client};
use candictl_common::Result;
use candictl_config::{MetaConfig, SchemaStore};
use candictl_kube::{get_meta_config, ClusterStateStore};
use candictl_ssh::{KubeProxy, SshClient};

/// How a command reaches the API server
#[derive(Debug, Clone)]
pub enum KubeAccess {
    /// Connect with a kubeconfig
    Kubeconfig(PathBuf),
    /// Tunnel to `kubectl proxy` on the master
    Ssh(SshClient),
}

/// An open connection. The proxy, if any, lives as long as the session.
pub struct KubeSession {
    client: Client,
    proxy: Option<KubeProxy>,
}

impl std::fmt::Debug for KubeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSession")
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}

impl KubeSession {
    /// Connect through `access`
    pub async fn connect(access: &KubeAccess) -> Result<Self> {
        match access {
            KubeAccess::Kubeconfig(path) => {
                info!(kubeconfig = %path.display(), "Connecting to Kubernetes API");
                Ok(Self {
                    client: create_client(Some(path)).await?,
                    proxy: None,
                })
            }
            KubeAccess::Ssh(ssh) => {
                info!("Connecting to Kubernetes API over SSH");
                let proxy = ssh.kube_proxy().await?;
                let client = create_proxy_client(proxy.local_port())?;
                Ok(Self {
                    client,
                    proxy: Some(proxy),
                })
            }
        }
    }

    /// Client for the session
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Stop the proxy; the client must not be used afterwards
    pub async fn stop(&mut self) {
        if let Some(mut proxy) = self.proxy.take() {
            proxy.stop().await;
        }
    }
}

/// Configuration stored in a running cluster, with the cluster UUID
pub async fn cluster_meta_config(
    client: &Client,
    store: &dyn ClusterStateStore,
    schema_store: &SchemaStore,
    cancel: &CancellationToken,
) -> Result<MetaConfig> {
    let mut meta = get_meta_config(client, schema_store, cancel).await?;
    meta.uuid = store.get_cluster_uuid().await?;
    Ok(meta)
}
