//! IaC pipelines for candictl
//!
//! A [`Runner`] owns one step of one provider layout: its variables, its state
//! file and the `terraform` subprocess. Pipelines compose a runner into
//! init → plan → apply (or destroy) and extract outputs. A [`StateSaver`]
//! streams intermediate state into the cluster while a long apply runs.

#![deny(missing_docs)]

pub mod factory;
pub mod pipeline;
pub mod runner;
pub mod saver;

pub use candictl_common::{Error, Result};
pub use factory::{NodeRunnerSpec, RunnerFactory, RunnerOptions};
pub use pipeline::{
    apply_pipeline, check_pipeline, destroy_pipeline, OutputsExtractor, PipelineOutputs,
};
pub use runner::{Runner, RunnerHandle, RunnerSettings, UseStateCache};
pub use saver::{StateDestination, StateSaver};

/// Step ordering the shared cloud resources
pub const BASE_INFRA_STEP: &str = "base-infrastructure";

/// Step ordering one master
pub const MASTER_NODE_STEP: &str = "master-node";

/// Step ordering one non-master node
pub const STATIC_NODE_STEP: &str = "static-node";

/// Step for nodes of `group`
pub fn step_for_group(group: &str) -> &'static str {
    if group == candictl_common::MASTER_NODE_GROUP {
        MASTER_NODE_STEP
    } else {
        STATIC_NODE_STEP
    }
}
