//! Shared Kubernetes helpers using kube-rs

use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use kube::api::{Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Api, Client, Config, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{Error, Result};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// 404 from the API server
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

/// 409 from the API server
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}

/// Create a kube client from an optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Create a kube client talking plain HTTP to a local `kubectl proxy` port
pub fn create_proxy_client(local_port: u16) -> Result<Client> {
    let url = format!("http://127.0.0.1:{}", local_port);
    let mut config = Config::new(url.parse().map_err(|e| {
        Error::internal_with_context("create_proxy_client", format!("invalid url {}: {}", url, e))
    })?);
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context(
            "create_proxy_client",
            format!("failed to create client: {}", e),
        )
    })
}

/// Parse apiVersion into (group, version)
///
/// ```
/// use candictl_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("deckhouse.io/v1alpha1"), ("deckhouse.io".to_string(), "v1alpha1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("sh") || lower.ends_with("ch") {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        if stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            format!("{}s", lower)
        } else {
            format!("{}ies", stem)
        }
    } else {
        format!("{}s", lower)
    }
}

/// Build an `ApiResource` from an apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Create `obj`, merge-patching it in place when it already exists
pub async fn create_or_merge<K>(api: &Api<K>, obj: &K) -> std::result::Result<(), kube::Error>
where
    K: Resource + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(()),
        Err(e) if is_already_exists(&e) => {
            let name = obj.meta().name.clone().unwrap_or_default();
            trace!(name = %name, "Object exists, merge-patching");
            api.patch(&name, &PatchParams::default(), &Patch::Merge(obj))
                .await?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Poll `check_fn` until it returns true, the timeout passes or `cancel` trips.
///
/// Errors from `check_fn` are treated as "not yet".
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    cancel: &CancellationToken,
    mut check_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::loop_cancelled(timeout_msg));
        }
        if start.elapsed() > timeout {
            return Err(Error::node_not_ready(timeout_msg));
        }

        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("Polling condition not yet met, retrying..."),
            Err(e) => trace!("Polling check returned error (retrying): {}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::loop_cancelled(timeout_msg)),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_pluralize_kind() {
        assert_eq!(pluralize_kind("NodeGroup"), "nodegroups");
        assert_eq!(pluralize_kind("MachineDeployment"), "machinedeployments");
        assert_eq!(pluralize_kind("StorageClass"), "storageclasses");
        assert_eq!(pluralize_kind("NetworkPolicy"), "networkpolicies");
        assert_eq!(pluralize_kind("Gateway"), "gateways");
    }

    #[test]
    fn test_build_api_resource() {
        let ar = build_api_resource("deckhouse.io/v1alpha1", "NodeGroup");
        assert_eq!(ar.group, "deckhouse.io");
        assert_eq!(ar.version, "v1alpha1");
        assert_eq!(ar.plural, "nodegroups");
    }

    #[tokio::test]
    async fn test_poll_until_succeeds() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        poll_until(
            Duration::from_secs(5),
            Duration::from_millis(1),
            "never",
            &CancellationToken::new(),
            || {
                let c = c.clone();
                async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
        )
        .await
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let result = poll_until(
            Duration::from_millis(20),
            Duration::from_millis(5),
            "deployment not ready",
            &CancellationToken::new(),
            || async { Ok(false) },
        )
        .await;
        assert!(matches!(result, Err(Error::NodeNotReady { .. })));
    }
}
