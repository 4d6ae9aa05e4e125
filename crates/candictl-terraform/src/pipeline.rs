//! Apply, check and destroy pipelines over a single runner

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, info_span, Instrument};

use candictl_common::{Error, Result};
use candictl_config::SchemaStore;

use crate::runner::Runner;

const CLOUD_DISCOVERY_OUTPUT: &str = "cloud_discovery_data";
const MASTER_IP_OUTPUT: &str = "master_ip_address_for_ssh";
const NODE_INTERNAL_IP_OUTPUT: &str = "node_internal_ip_address";
const DATA_DEVICE_PATH_OUTPUT: &str = "kubernetes_data_device_path";

/// What an apply yields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineOutputs {
    /// Final state blob
    pub terraform_state: Vec<u8>,
    /// Provider discovery data of the base infrastructure
    pub cloud_discovery: Vec<u8>,
    /// Master address reachable over SSH
    pub master_ip_for_ssh: String,
    /// Internal address of the node
    pub node_internal_ip: String,
    /// Block device for the Kubernetes data of a master
    pub kubernetes_data_device_path: String,
}

/// Which outputs to collect after apply
#[derive(Debug, Clone)]
pub enum OutputsExtractor {
    /// Cloud discovery data, validated when a schema store is given
    BaseInfra {
        /// Store holding the discovery data schema
        schema_store: Option<Arc<SchemaStore>>,
    },
    /// Addresses and data device of a master
    MasterNode,
    /// State only
    OnlyState,
}

impl OutputsExtractor {
    async fn extract(&self, runner: &Runner) -> Result<PipelineOutputs> {
        let mut outputs = PipelineOutputs {
            terraform_state: runner.get_state()?,
            ..Default::default()
        };

        match self {
            Self::OnlyState => {}
            Self::BaseInfra { schema_store } => {
                let raw = runner.get_output(CLOUD_DISCOVERY_OUTPUT).await?;
                let data: Value = serde_json::from_slice(&raw).map_err(|e| {
                    Error::serialization_for(CLOUD_DISCOVERY_OUTPUT, e.to_string())
                })?;
                if let Some(store) = schema_store {
                    store.validate(&data)?;
                }
                outputs.cloud_discovery = serde_json::to_vec(&data)?;
            }
            Self::MasterNode => {
                outputs.master_ip_for_ssh =
                    string_or_int(&runner.get_output(MASTER_IP_OUTPUT).await?)?;
                outputs.node_internal_ip =
                    string_or_int(&runner.get_output(NODE_INTERNAL_IP_OUTPUT).await?)?;
                outputs.kubernetes_data_device_path =
                    string_or_int(&runner.get_output(DATA_DEVICE_PATH_OUTPUT).await?)?;
            }
        }
        Ok(outputs)
    }
}

/// Decode a JSON output that is either a string or an integer.
///
/// Integers come back as their decimal representation.
pub fn string_or_int(raw: &[u8]) -> Result<String> {
    match serde_json::from_slice::<Value>(raw)? {
        Value::String(s) => Ok(s),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        other => Err(Error::serialization(format!(
            "expected a string or an integer output, got {}",
            other
        ))),
    }
}

fn aborted(name: &str, err: Error) -> Error {
    match err {
        Error::RunnerStopped { .. } => Error::pipeline_aborted(name, "runner was stopped"),
        other => other,
    }
}

/// init, plan, apply, then collect outputs
pub async fn apply_pipeline(
    runner: &mut Runner,
    name: &str,
    extractor: &OutputsExtractor,
) -> Result<PipelineOutputs> {
    async {
        info!("[{}] Terraform apply", name);
        runner.init().await?;
        runner.plan().await?;
        runner.apply().await?;
        extractor.extract(runner).await
    }
    .instrument(info_span!("pipeline", name = %name))
    .await
    .map_err(|e| aborted(name, e))
}

/// init and plan; returns whether the plan has changes
pub async fn check_pipeline(runner: &mut Runner, name: &str) -> Result<bool> {
    async {
        info!("[{}] Terraform check", name);
        runner.init().await?;
        runner.plan().await
    }
    .instrument(info_span!("pipeline", name = %name))
    .await
    .map_err(|e| aborted(name, e))
}

/// init and destroy, unless the state holds no resources
pub async fn destroy_pipeline(runner: &mut Runner, name: &str) -> Result<()> {
    async {
        if runner.resources_quantity_in_state() == 0 {
            info!("[{}] Nothing to destroy, state has no resources", name);
            return Ok(());
        }
        info!("[{}] Terraform destroy", name);
        runner.init().await?;
        runner.destroy().await
    }
    .instrument(info_span!("pipeline", name = %name))
    .await
    .map_err(|e| aborted(name, e))
}
