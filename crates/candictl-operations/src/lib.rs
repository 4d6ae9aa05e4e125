//! Cluster lifecycle drivers
//!
//! Bootstrap builds a cluster from nothing, converge reconciles a running one
//! with its configuration, destroy takes it apart and check reports the drift
//! without touching anything. Each driver composes IaC pipelines, the SSH
//! transport and the Kubernetes state store.

#![deny(missing_docs)]

pub mod abort;
pub mod bashible;
pub mod bootstrap;
pub mod check;
pub mod converge;
pub mod destroy;
pub mod exporter;
pub mod nodes;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use abort::{abort_bootstrap, nodes_from_cache, InfraDestroyer};
pub use bootstrap::{BootstrapOptions, Bootstrapper};
pub use candictl_common::{Error, Result};
pub use check::{check_state, InfraChecker, OutputFormat, Statistics, TerraformInfraChecker};
pub use converge::{Converger, NodeGroupController, NodeOperator};
pub use destroy::{ClusterDestroyer, DestroyOptions};
pub use exporter::{run_exporter, ClusterStatisticsSource, ExporterConfig};
pub use nodes::TerraformNodeOperator;
pub use session::{cluster_meta_config, KubeAccess, KubeSession};
