//! Converge exporter: runs the check periodically and serves the results as
//! Prometheus metrics.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use candictl_common::Result;
use candictl_config::SchemaStore;
use candictl_kube::{KubeNodeGroups, KubeStateStore};
use candictl_terraform::RunnerFactory;

use crate::check::{check_state, CheckStatus, Statistics, TerraformInfraChecker};
use crate::session::cluster_meta_config;

/// Base infrastructure status gauge
pub const CLUSTER_STATUS_METRIC: &str = "candi_converge_cluster_status";
/// Node group status gauge
pub const NODE_GROUP_STATUS_METRIC: &str = "candi_converge_node_group_status";
/// Node status gauge
pub const NODE_STATUS_METRIC: &str = "candi_converge_node_status";
/// Failed checks counter
pub const ERRORS_METRIC: &str = "candi_converge_exporter_errors";

/// Default metrics path
pub const DEFAULT_METRICS_PATH: &str = "/metrics";
/// Default listen address
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:9101";
/// Default time between checks
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

type LabelSet = Vec<(String, String)>;

#[derive(Debug, Default)]
struct Registry {
    gauges: BTreeMap<&'static str, BTreeMap<LabelSet, f64>>,
    errors: u64,
}

impl Registry {
    fn set(&mut self, metric: &'static str, labels: LabelSet, value: f64) {
        self.gauges.entry(metric).or_default().insert(labels, value);
    }

    fn set_status(&mut self, metric: &'static str, entity: &[(&str, &str)], status: CheckStatus) {
        for candidate in CheckStatus::ALL {
            let mut labels: LabelSet = entity
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            labels.push(("status".to_string(), candidate.as_str().to_string()));
            labels.sort();
            let value = if candidate == status { 1.0 } else { 0.0 };
            self.set(metric, labels, value);
        }
    }
}

/// Gauges and the error counter of the exporter
#[derive(Debug, Default)]
pub struct ConvergeMetrics {
    inner: RwLock<Registry>,
}

impl ConvergeMetrics {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `stats`. Series of entities missing from `stats` drop to zero.
    pub fn record(&self, stats: &Statistics) {
        let mut registry = self.inner.write();
        for series in registry.gauges.values_mut() {
            for value in series.values_mut() {
                *value = 0.0;
            }
        }

        registry.set_status(CLUSTER_STATUS_METRIC, &[], stats.cluster.status);
        for group in &stats.node_groups {
            registry.set_status(NODE_GROUP_STATUS_METRIC, &[("name", group.name.as_str())], group.status);
        }
        for node in &stats.nodes {
            registry.set_status(
                NODE_STATUS_METRIC,
                &[("node_group", node.group.as_str()), ("name", node.name.as_str())],
                node.status,
            );
        }
    }

    /// Count a failed check
    pub fn inc_errors(&self) {
        self.inner.write().errors += 1;
    }

    /// Failed checks so far
    pub fn errors(&self) -> u64 {
        self.inner.read().errors
    }

    /// Value of one gauge series
    pub fn gauge(&self, metric: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let mut wanted: LabelSet = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        wanted.sort();
        self.inner.read().gauges.get(metric)?.get(&wanted).copied()
    }

    /// Prometheus text exposition
    pub fn render(&self) -> String {
        let registry = self.inner.read();
        let mut out = String::new();
        for (metric, series) in &registry.gauges {
            let _ = writeln!(out, "# HELP {} Converge status, one series per status value", metric);
            let _ = writeln!(out, "# TYPE {} gauge", metric);
            for (labels, value) in series {
                let _ = writeln!(out, "{}{} {}", metric, format_labels(labels), value);
            }
        }
        let _ = writeln!(out, "# HELP {} Failed converge checks", ERRORS_METRIC);
        let _ = writeln!(out, "# TYPE {} counter", ERRORS_METRIC);
        let _ = writeln!(out, "{} {}", ERRORS_METRIC, registry.errors);
        out
    }
}

fn format_labels(labels: &LabelSet) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let inner: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
        .collect();
    format!("{{{}}}", inner.join(","))
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn index_page(metrics_path: &str) -> String {
    format!(
        "<html>\n<head><title>Converge exporter</title></head>\n<body>\n\
         <h1>Converge exporter</h1>\n<p><a href=\"{0}\">Metrics</a></p>\n</body>\n</html>\n",
        metrics_path
    )
}

async fn metrics_handler(State(metrics): State<Arc<ConvergeMetrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics.render(),
    )
}

/// Routes of the exporter
pub fn exporter_routes(metrics: Arc<ConvergeMetrics>, metrics_path: &str) -> Router {
    let page = index_page(metrics_path);
    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/",
            get(move || {
                let page = page.clone();
                async move { Html(page) }
            }),
        )
        .with_state(metrics)
}

/// Produces one round of check results
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatisticsSource: Send + Sync {
    /// Run the check
    async fn collect(&self) -> Result<Statistics>;
}

/// Run one check and publish its result
pub async fn check_once(metrics: &ConvergeMetrics, source: &dyn StatisticsSource) {
    match source.collect().await {
        Ok(stats) => {
            debug!(nodes = stats.nodes.len(), "Check finished");
            metrics.record(&stats);
        }
        Err(e) => {
            error!(error = %e, "Converge check failed");
            metrics.inc_errors();
        }
    }
}

/// Exporter settings
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// HTTP listen address
    pub listen_address: SocketAddr,
    /// Path of the metrics page
    pub metrics_path: String,
    /// Time between checks
    pub check_interval: Duration,
}

impl ExporterConfig {
    /// Settings with the metrics path normalised to start with `/`
    pub fn new(listen_address: SocketAddr, metrics_path: &str, check_interval: Duration) -> Self {
        let metrics_path = if metrics_path.starts_with('/') {
            metrics_path.to_string()
        } else {
            format!("/{}", metrics_path)
        };
        Self {
            listen_address,
            metrics_path,
            check_interval,
        }
    }
}

/// Serve metrics and re-run the check every interval until cancelled
pub async fn run_exporter(
    config: ExporterConfig,
    source: Arc<dyn StatisticsSource>,
    cancel: CancellationToken,
) -> Result<()> {
    let metrics = Arc::new(ConvergeMetrics::new());
    let app = exporter_routes(metrics.clone(), &config.metrics_path);
    let listener = TcpListener::bind(config.listen_address).await?;
    info!(addr = %config.listen_address, path = %config.metrics_path, "Converge exporter started");

    let shutdown = cancel.clone();
    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    };

    let checks = async move {
        let mut ticker = tokio::time::interval(config.check_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            check_once(&metrics, source.as_ref()).await;
        }
    };

    let (served, ()) = tokio::join!(server, checks);
    served?;
    info!("Converge exporter stopped");
    Ok(())
}

/// [`StatisticsSource`] reading the configuration and states from the cluster
pub struct ClusterStatisticsSource {
    client: Client,
    factory: RunnerFactory,
    schema_store: Arc<SchemaStore>,
    cancel: CancellationToken,
    scratch_dir: PathBuf,
}

impl ClusterStatisticsSource {
    /// Source using `client`; runner files go to `scratch_dir`, which is
    /// emptied after every round.
    pub fn new(
        client: Client,
        factory: RunnerFactory,
        schema_store: Arc<SchemaStore>,
        cancel: CancellationToken,
        scratch_dir: PathBuf,
    ) -> Self {
        Self {
            client,
            factory,
            schema_store,
            cancel,
            scratch_dir,
        }
    }

    fn clear_scratch(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.scratch_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.scratch_dir.display(), error = %e, "Unable to clear temporary files");
            }
        }
    }
}

#[async_trait]
impl StatisticsSource for ClusterStatisticsSource {
    async fn collect(&self) -> Result<Statistics> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        let result = async {
            let store = KubeStateStore::new(self.client.clone(), self.cancel.clone());
            let meta = cluster_meta_config(&self.client, &store, &self.schema_store, &self.cancel).await?;
            let meta = Arc::new(meta);
            let node_groups = KubeNodeGroups::new(self.client.clone(), self.cancel.clone());
            let checker = TerraformInfraChecker::new(meta.clone(), self.factory.clone());
            check_state(&meta, &store, &node_groups, &checker).await
        }
        .await;
        self.clear_scratch();
        result
    }
}
