//! Kubernetes side of candictl
//!
//! The IaC state of a running cluster lives in Secrets; this crate reads and
//! writes it, drives NodeGroups and Nodes, installs the platform, applies
//! declarative resources and cleans the cluster up before destroy.

#![deny(missing_docs)]

pub mod cluster_config;
pub mod destroy;
pub mod entity;
pub mod install;
pub mod manifests;
pub mod resources;
pub mod savers;
pub mod state_store;

pub use candictl_common::{Error, Result};
pub use cluster_config::{get_meta_config, ConfigSecret};
pub use destroy::ClusterCleaner;
pub use entity::{KubeNodeGroups, NodeGroupApi};
pub use install::{install_deckhouse, prepare_install_config, InstallConfig};
pub use resources::{create_resources, CreateResourcesOptions, KubeResourceApplier, ResourceApplier};
pub use savers::{ClusterStateSaver, NodeStateSaver};
pub use state_store::{ClusterStateStore, KubeStateStore, NodeGroupTerraformState, NodesState};
