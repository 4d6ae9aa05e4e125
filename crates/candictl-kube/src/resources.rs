//! Declarative resources applied after install
//!
//! Resources may depend on CRDs or namespaces the platform creates later, so
//! failures are requeued and retried until a full pass makes no progress.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use candictl_common::kube_utils::{build_api_resource, create_or_merge};
use candictl_common::{Error, MultiError, Result};
use candictl_config::Resource;

/// Creates or updates one resource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceApplier: Send + Sync {
    /// Apply `resource`, succeeding if it already exists
    async fn apply(&self, resource: &Resource) -> Result<()>;
}

/// [`ResourceApplier`] using dynamic objects
#[derive(Clone)]
pub struct KubeResourceApplier {
    client: Client,
}

impl KubeResourceApplier {
    /// Applier on `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceApplier for KubeResourceApplier {
    async fn apply(&self, resource: &Resource) -> Result<()> {
        let ar = build_api_resource(&resource.api_version, &resource.kind);
        let api: Api<DynamicObject> = match &resource.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        let obj: DynamicObject = serde_json::from_value(resource.object.clone())
            .map_err(|e| Error::serialization_for(resource.kind.clone(), e.to_string()))?;
        create_or_merge(&api, &obj).await?;
        Ok(())
    }
}

/// Tuning of [`create_resources`]
#[derive(Debug, Clone)]
pub struct CreateResourcesOptions {
    /// Pause between passes
    pub pass_delay: Duration,
    /// Passes without progress tolerated before giving up
    pub stalled_passes: u32,
}

/// Fifteen minutes at the default pass delay
const DEFAULT_STALLED_PASSES: u32 = 90;

impl Default for CreateResourcesOptions {
    fn default() -> Self {
        Self {
            pass_delay: Duration::from_secs(10),
            stalled_passes: DEFAULT_STALLED_PASSES,
        }
    }
}

/// Apply `resources` in declared order, requeueing failures.
///
/// Stops when every resource is applied, or when `options.stalled_passes`
/// consecutive passes apply nothing. The last error of each remaining resource
/// is returned as a multi-error.
pub async fn create_resources(
    applier: &dyn ResourceApplier,
    resources: &[Resource],
    options: &CreateResourcesOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut queue: VecDeque<&Resource> = resources.iter().collect();
    let mut stalled = 0;
    let mut pass = 0;

    info!("[Resources] Creating {} resources", queue.len());

    while !queue.is_empty() {
        if cancel.is_cancelled() {
            return Err(Error::loop_cancelled("Create resources"));
        }
        pass += 1;

        let mut failed = Vec::new();
        let mut errors = MultiError::new();
        let before = queue.len();

        while let Some(resource) = queue.pop_front() {
            match applier.apply(resource).await {
                Ok(()) => info!("{} created", resource),
                Err(e) => {
                    debug!(resource = %resource, pass, error = %e, "Resource not created, requeueing");
                    errors.push(Error::kube_api(format!("create {}", resource), e.to_string()));
                    failed.push(resource);
                }
            }
        }

        if failed.is_empty() {
            break;
        }

        if failed.len() == before {
            stalled += 1;
            if stalled >= options.stalled_passes {
                warn!(remaining = failed.len(), "Not all resources were created");
                return errors.into_result();
            }
        } else {
            stalled = 0;
        }

        queue.extend(failed);
        info!(
            remaining = queue.len(),
            "[Resources] Retrying in {}s",
            options.pass_delay.as_secs()
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::loop_cancelled("Create resources")),
            _ = tokio::time::sleep(options.pass_delay) => {}
        }
    }

    info!("[Resources] All resources created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn resource(kind: &str, name: &str) -> Resource {
        Resource::from_value(json!({
            "apiVersion": "deckhouse.io/v1",
            "kind": kind,
            "metadata": { "name": name },
        }))
        .unwrap()
    }

    fn fast() -> CreateResourcesOptions {
        CreateResourcesOptions {
            pass_delay: Duration::ZERO,
            stalled_passes: 1,
        }
    }

    #[tokio::test]
    async fn test_failed_resource_is_requeued() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let mut applier = MockResourceApplier::new();
        applier
            .expect_apply()
            .withf(|r| r.kind == "User")
            .returning(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::kube_api("create", "no matches for kind User"))
                } else {
                    Ok(())
                }
            });
        applier
            .expect_apply()
            .withf(|r| r.kind == "IngressNginxController")
            .times(1)
            .returning(|_| Ok(()));

        let resources = vec![resource("User", "admin"), resource("IngressNginxController", "main")];
        create_resources(&applier, &resources, &fast(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_progress_returns_all_errors() {
        let mut applier = MockResourceApplier::new();
        applier
            .expect_apply()
            .times(2)
            .returning(|r| Err(Error::kube_api("create", format!("{} rejected", r.name))));

        let resources = vec![resource("User", "a"), resource("User", "b")];
        let err = create_resources(&applier, &resources, &fast(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::Multi(multi) => assert_eq!(multi.len(), 2),
            other => panic!("expected multi error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stall_tolerance() {
        let mut applier = MockResourceApplier::new();
        applier
            .expect_apply()
            .times(3)
            .returning(|_| Err(Error::kube_api("create", "still failing")));

        let options = CreateResourcesOptions {
            pass_delay: Duration::ZERO,
            stalled_passes: 3,
        };
        let result = create_resources(
            &applier,
            &[resource("User", "a")],
            &options,
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_default_waits_for_unserved_kinds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let mut applier = MockResourceApplier::new();
        applier.expect_apply().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 5 {
                Err(Error::kube_api("create", "no matches for kind User"))
            } else {
                Ok(())
            }
        });

        let options = CreateResourcesOptions {
            pass_delay: Duration::ZERO,
            ..Default::default()
        };
        create_resources(&applier, &[resource("User", "admin")], &options, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_empty_list() {
        let applier = MockResourceApplier::new();
        create_resources(&applier, &[], &fast(), &CancellationToken::new())
            .await
            .unwrap();
    }
}
