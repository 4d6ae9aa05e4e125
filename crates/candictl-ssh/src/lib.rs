//! SSH transport for candictl
//!
//! Everything goes through the system `ssh` and `scp` binaries with a private
//! `ssh-agent`. The client runs commands (optionally under sudo), uploads
//! scripts and bundles, opens local port forwards and keeps a `kubectl proxy`
//! on the master reachable for the Kubernetes client.

#![deny(missing_docs)]

pub mod agent;
pub mod client;
pub mod command;
pub mod kube_proxy;
pub mod settings;
pub mod tunnel;
pub mod upload;

pub use candictl_common::{Error, Result};
pub use client::{Check, SshClient};
pub use command::SshCommand;
pub use kube_proxy::KubeProxy;
pub use settings::SshSettings;
pub use tunnel::{Tunnel, TunnelSpec};
pub use upload::UploadScript;
