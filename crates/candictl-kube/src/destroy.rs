//! In-cluster cleanup before infrastructure is destroyed
//!
//! Cloud objects owned by the cluster (load balancers, volumes, machines) must
//! be released through Kubernetes first, otherwise the IaC destroy leaves them
//! orphaned.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use candictl_common::input::Prompter;
use candictl_common::kube_utils::{build_api_resource, is_not_found};
use candictl_common::retry::{retry_loop, RetryConfig};
use candictl_common::{Error, Result, DECKHOUSE_NAMESPACE};

use crate::manifests::DECKHOUSE_NAME;

/// API group of machine-controller-manager machines
pub const MCM_API_VERSION: &str = "machine.sapcloud.io/v1alpha1";
/// API group of Cluster API machines
pub const CAPI_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";

const MACHINES_NOT_DELETED: &str = "Machines weren't deleted from the cluster. Do you want to continue?";

/// Whether a pod mounts a PersistentVolumeClaim
pub fn has_claim_volume(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .is_some_and(|volumes| volumes.iter().any(|v| v.persistent_volume_claim.is_some()))
}

/// Whether a Service provisions a cloud load balancer
pub fn is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        == Some("LoadBalancer")
}

/// Claims still bound to a volume. Pending claims never got one.
pub fn bound_claims(claims: &[PersistentVolumeClaim]) -> Vec<&PersistentVolumeClaim> {
    claims
        .iter()
        .filter(|c| claim_phase(c) != "Pending")
        .collect()
}

fn claim_phase(claim: &PersistentVolumeClaim) -> &str {
    claim
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

fn volume_phase(volume: &PersistentVolume) -> &str {
    volume
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

/// Explain why volumes remain, or `None` when all are gone
pub fn remaining_volumes_report(volumes: &[PersistentVolume]) -> Option<String> {
    if volumes.is_empty() {
        return None;
    }
    let listing: Vec<String> = volumes
        .iter()
        .map(|v| format!("\t\t{} | {}", v.name_any(), volume_phase(v)))
        .collect();
    let retained = volumes.iter().any(|v| {
        v.spec
            .as_ref()
            .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
            != Some("Delete")
    });
    let head = if retained {
        format!(
            "{} PersistentVolumes with reclaimPolicy other than Delete in the cluster. \
             Set their reclaim policy to Delete or remove them manually",
            volumes.len()
        )
    } else {
        format!("{} PersistentVolumes left in the cluster", volumes.len())
    };
    Some(format!("{}\n{}", head, listing.join("\n")))
}

/// Whether discovery lists both Machine and MachineDeployment
pub fn machines_api_available(list: &APIResourceList) -> bool {
    let has = |kind: &str| list.resources.iter().any(|r| r.kind == kind);
    has("Machine") && has("MachineDeployment")
}

fn listing(items: &[(String, String)]) -> String {
    items
        .iter()
        .map(|(ns, name)| format!("\t\t{}/{}", ns, name))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Machine flavour managed by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachinesKind {
    /// machine-controller-manager
    Mcm,
    /// Cluster API
    Capi,
}

impl MachinesKind {
    fn api_version(self) -> &'static str {
        match self {
            Self::Mcm => MCM_API_VERSION,
            Self::Capi => CAPI_API_VERSION,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Mcm => "MCM",
            Self::Capi => "CAPI",
        }
    }

    /// Patch letting the controller drop a machine without draining it
    pub fn force_patch(self) -> serde_json::Value {
        match self {
            Self::Mcm => json!({ "metadata": { "labels": { "force-deletion": "True" } } }),
            Self::Capi => json!({ "spec": { "nodeDrainTimeout": "10s" } }),
        }
    }
}

/// Deletes cluster objects that hold cloud resources
pub struct ClusterCleaner {
    client: Client,
    cancel: CancellationToken,
    prompter: Arc<dyn Prompter>,
    delete_retry: RetryConfig,
    wait_retry: RetryConfig,
}

impl ClusterCleaner {
    /// Cleaner on `client`; `prompter` decides whether to go on without machines API
    pub fn new(client: Client, cancel: CancellationToken, prompter: Arc<dyn Prompter>) -> Self {
        Self {
            client,
            cancel,
            prompter,
            delete_retry: RetryConfig::new(45, Duration::from_secs(5)).silent(),
            wait_retry: RetryConfig::new(45, Duration::from_secs(15)).silent(),
        }
    }

    /// Run the whole sequence in dependency order
    pub async fn delete_resources(&self) -> Result<()> {
        info!("[Destroy] Delete resources from the Kubernetes cluster");
        self.delete_deckhouse_deployment().await?;
        self.wait_for_deckhouse_deployment_deletion().await?;
        self.delete_load_balancers().await?;
        self.wait_for_load_balancers_deletion().await?;
        self.delete_storage_classes().await?;
        self.delete_pods_with_claims().await?;
        self.delete_claims().await?;
        self.wait_for_claims_deletion().await?;
        self.wait_for_volumes_deletion().await?;
        self.delete_machines().await
    }

    /// Foreground-delete the controller so it stops reconciling
    pub async fn delete_deckhouse_deployment(&self) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), DECKHOUSE_NAMESPACE);
        retry_loop(&self.delete_retry, "Delete Deckhouse", &self.cancel, || async {
            match api.delete(DECKHOUSE_NAME, &DeleteParams::foreground()).await {
                Ok(_) => Ok(()),
                Err(e) if is_not_found(&e) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn wait_for_deckhouse_deployment_deletion(&self) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), DECKHOUSE_NAMESPACE);
        retry_loop(
            &RetryConfig::new(30, Duration::from_secs(5)).silent(),
            "Wait for Deckhouse Deployment deletion",
            &self.cancel,
            || async {
                match api.get_opt(DECKHOUSE_NAME).await? {
                    None => Ok(()),
                    Some(_) => Err(Error::kube_api(
                        "wait for deployment deletion",
                        "Deckhouse Deployment and its dependents are not deleted yet",
                    )),
                }
            },
        )
        .await
    }

    async fn delete_load_balancers(&self) -> Result<()> {
        let all: Api<Service> = Api::all(self.client.clone());
        retry_loop(&self.delete_retry, "Delete Services", &self.cancel, || async {
            for svc in all.list(&ListParams::default()).await?.items {
                if !is_load_balancer(&svc) {
                    continue;
                }
                let ns = svc.namespace().unwrap_or_default();
                let api: Api<Service> = Api::namespaced(self.client.clone(), &ns);
                api.delete(&svc.name_any(), &DeleteParams::default()).await?;
                info!("{}/{}", ns, svc.name_any());
            }
            Ok(())
        })
        .await
    }

    async fn wait_for_load_balancers_deletion(&self) -> Result<()> {
        let all: Api<Service> = Api::all(self.client.clone());
        retry_loop(&self.wait_retry, "Wait for Services deletion", &self.cancel, || async {
            let left: Vec<Service> = all
                .list(&ListParams::default())
                .await?
                .items
                .into_iter()
                .filter(is_load_balancer)
                .collect();
            if left.is_empty() {
                info!("All Services are deleted from the cluster");
                return Ok(());
            }
            let names: Vec<(String, String)> = left
                .iter()
                .map(|s| (s.namespace().unwrap_or_default(), s.name_any()))
                .collect();
            Err(Error::kube_api(
                "wait for services deletion",
                format!(
                    "{} Services left in the cluster\n{}",
                    left.len(),
                    listing(&names)
                ),
            ))
        })
        .await
    }

    async fn delete_storage_classes(&self) -> Result<()> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        retry_loop(&self.delete_retry, "Delete StorageClasses", &self.cancel, || async {
            api.delete_collection(&DeleteParams::default(), &ListParams::default())
                .await?;
            Ok(())
        })
        .await
    }

    async fn delete_pods_with_claims(&self) -> Result<()> {
        let all: Api<Pod> = Api::all(self.client.clone());
        retry_loop(&self.delete_retry, "Delete Pods", &self.cancel, || async {
            for pod in all.list(&ListParams::default()).await?.items {
                if !has_claim_volume(&pod) {
                    continue;
                }
                let ns = pod.namespace().unwrap_or_default();
                let api: Api<Pod> = Api::namespaced(self.client.clone(), &ns);
                match api.delete(&pod.name_any(), &DeleteParams::default()).await {
                    Ok(_) => info!("{}/{}", ns, pod.name_any()),
                    Err(e) => error!(pod = %pod.name_any(), namespace = %ns, error = %e, "Unable to delete pod"),
                }
            }
            Ok(())
        })
        .await
    }

    async fn delete_claims(&self) -> Result<()> {
        let all: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        retry_loop(&self.delete_retry, "Delete PersistentVolumeClaims", &self.cancel, || async {
            for claim in all.list(&ListParams::default()).await?.items {
                let ns = claim.namespace().unwrap_or_default();
                let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &ns);
                api.delete(&claim.name_any(), &DeleteParams::default()).await?;
                info!("{}/{}", ns, claim.name_any());
            }
            Ok(())
        })
        .await
    }

    async fn wait_for_claims_deletion(&self) -> Result<()> {
        let all: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        retry_loop(
            &self.wait_retry,
            "Wait for PersistentVolumeClaims deletion",
            &self.cancel,
            || async {
                let claims = all.list(&ListParams::default()).await?.items;
                let bound = bound_claims(&claims);
                if bound.is_empty() {
                    info!("All PersistentVolumeClaims are deleted from the cluster");
                    return Ok(());
                }
                let rows: Vec<String> = claims
                    .iter()
                    .map(|c| format!("\t\t{} | {}", c.name_any(), claim_phase(c)))
                    .collect();
                Err(Error::kube_api(
                    "wait for claims deletion",
                    format!(
                        "{} PersistentVolumeClaims left in the cluster\n{}",
                        bound.len(),
                        rows.join("\n")
                    ),
                ))
            },
        )
        .await
    }

    async fn wait_for_volumes_deletion(&self) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        retry_loop(
            &self.wait_retry,
            "Wait for PersistentVolumes deletion",
            &self.cancel,
            || async {
                let volumes = api.list(&ListParams::default()).await?.items;
                match remaining_volumes_report(&volumes) {
                    None => {
                        info!("All PersistentVolumes are deleted from the cluster");
                        Ok(())
                    }
                    Some(report) => Err(Error::kube_api("wait for volumes deletion", report)),
                }
            },
        )
        .await
    }

    async fn check_api(&self, kind: MachinesKind) -> Result<()> {
        retry_loop(
            &RetryConfig::new(5, Duration::from_secs(5)).silent(),
            &format!("Get Kubernetes cluster resources for {} group/version", kind.label()),
            &self.cancel,
            || async {
                let list = self.client.list_api_group_resources(kind.api_version()).await?;
                if machines_api_available(&list) {
                    Ok(())
                } else {
                    Err(Error::kube_api(
                        "discover machines api",
                        format!("Machine and MachineDeployment are not served by {}", kind.api_version()),
                    ))
                }
            },
        )
        .await
    }

    /// Delete MCM machines then Cluster API machines.
    ///
    /// When a machines API is not served the operator decides whether to go
    /// on with the next kind.
    pub async fn delete_machines(&self) -> Result<()> {
        delete_machines_with(self, &*self.prompter).await
    }

    fn dynamic(&self, kind: MachinesKind, resource_kind: &str) -> Api<DynamicObject> {
        let ar = build_api_resource(kind.api_version(), resource_kind);
        Api::all_with(self.client.clone(), &ar)
    }

    fn dynamic_in(&self, kind: MachinesKind, resource_kind: &str, ns: &str) -> Api<DynamicObject> {
        let ar = build_api_resource(kind.api_version(), resource_kind);
        Api::namespaced_with(self.client.clone(), ns, &ar)
    }

    async fn delete_machine_deployments(&self, kind: MachinesKind) -> Result<()> {
        let machines = self.dynamic(kind, "Machine");
        let deployments = self.dynamic(kind, "MachineDeployment");
        let patch = kind.force_patch();

        retry_loop(
            &RetryConfig::new(45, Duration::from_secs(5)),
            &format!("Delete {} MachineDeployments", kind.label()),
            &self.cancel,
            || async {
                for machine in machines.list(&ListParams::default()).await?.items {
                    let ns = machine.namespace().unwrap_or_default();
                    self.dynamic_in(kind, "Machine", &ns)
                        .patch(&machine.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                        .await
                        .map_err(|e| {
                            Error::kube_api(format!("patch machine {}", machine.name_any()), e.to_string())
                        })?;
                }
                for md in deployments.list(&ListParams::default()).await?.items {
                    let ns = md.namespace().unwrap_or_default();
                    self.dynamic_in(kind, "MachineDeployment", &ns)
                        .delete(&md.name_any(), &DeleteParams::default())
                        .await
                        .map_err(|e| {
                            Error::kube_api(
                                format!("delete machinedeployments {}", md.name_any()),
                                e.to_string(),
                            )
                        })?;
                    info!("{}/{}", ns, md.name_any());
                }
                Ok(())
            },
        )
        .await
    }

    async fn wait_for_machines_deletion(&self, kind: MachinesKind) -> Result<()> {
        let machines = self.dynamic(kind, "Machine");
        retry_loop(
            &self.wait_retry,
            &format!("Wait for {} Machines deletion", kind.label()),
            &self.cancel,
            || async {
                let items = machines.list(&ListParams::default()).await?.items;
                if items.is_empty() {
                    info!("All {} Machines are deleted from the cluster", kind.label());
                    return Ok(());
                }
                let names: Vec<(String, String)> = items
                    .iter()
                    .map(|m| (m.namespace().unwrap_or_default(), m.name_any()))
                    .collect();
                Err(Error::kube_api(
                    "wait for machines deletion",
                    format!(
                        "{} {} Machines left in the cluster\n{}",
                        items.len(),
                        kind.label(),
                        listing(&names)
                    ),
                ))
            },
        )
        .await
    }
}

#[async_trait]
impl MachineCleanup for ClusterCleaner {
    async fn check_machines_api(&self, kind: MachinesKind) -> Result<()> {
        self.check_api(kind).await
    }

    async fn delete_machines_of(&self, kind: MachinesKind) -> Result<()> {
        self.delete_machine_deployments(kind).await?;
        self.wait_for_machines_deletion(kind).await
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
trait MachineCleanup: Send + Sync {
    async fn check_machines_api(&self, kind: MachinesKind) -> Result<()>;
    async fn delete_machines_of(&self, kind: MachinesKind) -> Result<()>;
}

async fn delete_machines_with(cleanup: &dyn MachineCleanup, prompter: &dyn Prompter) -> Result<()> {
    for kind in [MachinesKind::Mcm, MachinesKind::Capi] {
        if let Err(e) = cleanup.check_machines_api(kind).await {
            if e.is_cancellation() {
                return Err(e);
            }
            warn!(
                api_version = kind.api_version(),
                error = %e,
                "Can't get machine resources"
            );
            if !prompter.confirm(MACHINES_NOT_DELETED, true) {
                return Err(Error::pipeline_aborted("destroy", "Machines deletion aborted"));
            }
            continue;
        }
        cleanup.delete_machines_of(kind).await?;
    }
    Ok(())
}
