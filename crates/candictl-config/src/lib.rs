//! Cluster configuration for candictl
//!
//! Parses the user's declarative documents (`ClusterConfiguration`,
//! `InitConfiguration`, `StaticClusterConfiguration` and the provider's
//! `<Provider>ClusterConfiguration`) into a [`MetaConfig`], validating each
//! one against the bundled OpenAPI schemas.

#![deny(missing_docs)]

pub mod meta;
pub mod naming;
pub mod parse;
pub mod resources;
pub mod schema;

pub use candictl_common::{Error, Result};
pub use meta::{ClusterType, DeckhouseClusterConfig, MetaConfig, TerraNodeGroupSpec};
pub use parse::{parse_config, parse_config_from_data};
pub use resources::{parse_resources, Resource};
pub use schema::{SchemaIndex, SchemaStore};

/// Default location of provider layouts
pub const DEFAULT_PROVIDERS_DIR: &str = "/deckhouse/candi/cloud-providers";

/// Default location of the cluster-wide OpenAPI schemas
pub const DEFAULT_SCHEMA_DIR: &str = "/deckhouse/candi/openapi";
