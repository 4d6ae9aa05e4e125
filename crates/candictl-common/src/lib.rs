//! Common building blocks for candictl: errors, retries, teardown, state cache

#![deny(missing_docs)]

pub mod cache;
pub mod error;
pub mod input;
pub mod kube_utils;
pub mod logging;
pub mod process;
pub mod retry;
pub mod teardown;

pub use error::{Error, MultiError};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace holding platform resources and IaC state Secrets
pub const DECKHOUSE_NAMESPACE: &str = "d8-system";

/// Namespace holding cluster configuration Secrets
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Namespace holding per-node-group bootstrap Secrets
pub const CLOUD_INSTANCE_MANAGER_NAMESPACE: &str = "d8-cloud-instance-manager";

/// Default directory for temporary files and state caches
pub const DEFAULT_TMP_DIR: &str = "/tmp/candictl";

/// Node group holding control-plane nodes
pub const MASTER_NODE_GROUP: &str = "master";
