//! Converge command

use std::sync::Arc;

use clap::Args;
use kube::Client;
use tracing::info;

use candictl_config::SchemaStore;
use candictl_kube::{ClusterStateStore, KubeNodeGroups, KubeStateStore};
use candictl_operations::{cluster_meta_config, Converger, TerraformNodeOperator};
use candictl_terraform::UseStateCache;

use super::Context;
use crate::{KubeArgs, Result};

/// Converge arguments
#[derive(Args, Debug, Clone)]
pub struct ConvergeArgs {
    /// Kubernetes and SSH connection
    #[command(flatten)]
    pub kube: KubeArgs,
}

/// Reconcile the running cluster with the configuration it stores
pub async fn run(ctx: &Context, args: ConvergeArgs) -> Result<()> {
    let schema_store = ctx.schema_store()?;
    let mut session = ctx.kube_session(&args.kube).await?;
    let result = converge(ctx, session.client(), schema_store).await;
    session.stop().await;
    result
}

async fn converge(ctx: &Context, client: Client, schema_store: Arc<SchemaStore>) -> Result<()> {
    let cancel = ctx.teardown.cancellation_token();
    let store: Arc<dyn ClusterStateStore> =
        Arc::new(KubeStateStore::new(client.clone(), cancel.clone()));
    let meta = cluster_meta_config(&client, store.as_ref(), &schema_store, &cancel).await?;
    let meta = Arc::new(meta);

    let cache = ctx.scratch_cache("converge")?;
    let factory = ctx.factory(ctx.runner_settings(UseStateCache::No), cache);
    let node_groups = Arc::new(KubeNodeGroups::new(client, cancel));
    let operator = Arc::new(
        TerraformNodeOperator::new(meta.clone(), factory.clone(), store.clone())
            .with_auto_approve(ctx.auto_approve()),
    );

    Converger::new(
        meta,
        factory,
        store,
        node_groups,
        operator,
        ctx.prompter.clone(),
    )
    .with_schema_store(schema_store)
    .with_auto_approve(ctx.auto_approve())
    .run()
    .await?;

    info!("[Converge] Done");
    Ok(())
}
