//! Fleet operator - fans AppSets out to member clusters and reconciles
//! AdvDeployments into workloads

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use kube::CustomResourceExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fleet_advdeployment::{AdvConfig, AdvDeploymentReconciler, ManifestRenderer};
use fleet_appset::AppSetReconciler;
use fleet_cluster::{
    default_transform, owner_transform, BeforeStartHook, ClusterConfigSource, ClusterDescriptor,
    ClusterHandle, ConfigMapConfigSource, CredentialType, FleetRegistry, HandleOptions,
    KubeHandleFactory, KubeObjectStore, LabelsKeyPredicate, NamespacePredicate,
    PathConfigSource, Predicate, RegistryOptions, SpecOrMetaChanged,
};
use fleet_common::crd::{AdvDeployment, AppSet};
use fleet_common::events::{EventPublisher, KubeEventPublisher};
use fleet_common::kube_utils::{create_client_with_timeout, KubeconfigSource, DEFAULT_READ_TIMEOUT};
use fleet_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use fleet_common::{APP_LABEL, CLUSTER_NAME_LABEL, CONTROLLER_NAME};
use fleet_queue::WorkQueue;

/// Name the home cluster's handle reports in logs and errors
const HOME_CLUSTER: &str = "home";

/// Fleet - multi-cluster workload orchestrator
#[derive(Parser, Debug)]
#[command(name = "fleet-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Which pipelines this process runs
    #[arg(long, env = "FLEET_MODE", value_enum, default_value_t = Mode::All)]
    mode: Mode,

    /// Kubeconfig of the home cluster; in-cluster config or $KUBECONFIG when unset
    #[arg(long, env = "FLEET_HOME_KUBECONFIG")]
    home_kubeconfig: Option<PathBuf>,

    /// Where member cluster credentials come from
    #[arg(long, env = "FLEET_CLUSTER_SOURCE", value_enum, default_value_t = SourceKind::Path)]
    cluster_source: SourceKind,

    /// Directory of member kubeconfigs, one file per cluster
    #[arg(long, env = "FLEET_CLUSTER_CONFIG_DIR", default_value = "/etc/fleet/clusters")]
    cluster_config_dir: PathBuf,

    /// File suffix marking a member kubeconfig
    #[arg(long, env = "FLEET_CLUSTER_CONFIG_SUFFIX", default_value = "kubeconfig")]
    cluster_config_suffix: String,

    /// How a credential is read: `file` (path) or `rawstring` (content)
    #[arg(long, env = "FLEET_CREDENTIAL_TYPE", default_value = "file")]
    credential_type: String,

    /// Namespace holding cluster config maps
    #[arg(long, env = "FLEET_CONFIGMAP_NAMESPACE", default_value = "fleet-system")]
    configmap_namespace: String,

    /// Labels selecting cluster config maps, `k=v[,k=v]`
    #[arg(long, env = "FLEET_CONFIGMAP_LABELS", default_value = "fleet.io/cluster-config=true")]
    configmap_labels: String,

    /// Config map key holding the kubeconfig
    #[arg(long, env = "FLEET_CONFIGMAP_DATA_KEY", default_value = "kubeconfig")]
    configmap_data_key: String,

    /// Config map key that disables a cluster unless it is `true`
    #[arg(long, env = "FLEET_CONFIGMAP_STATUS_KEY", default_value = "enabled")]
    configmap_status_key: String,

    /// Seconds between registry rebuilds; 0 disables rebuilding
    #[arg(long, env = "FLEET_REBUILD_INTERVAL_SECS", default_value_t = 30)]
    rebuild_interval_secs: u64,

    /// Bound on every cluster API call, in milliseconds
    #[arg(long, env = "FLEET_EXEC_TIMEOUT_MS", default_value_t = 5000)]
    exec_timeout_ms: u64,

    /// Seconds between health probes; below 1 disables probing
    #[arg(long, env = "FLEET_HEALTH_CHECK_INTERVAL_SECS", default_value_t = 5)]
    health_check_interval_secs: u64,

    /// Namespace whose workloads are watched, `*` for all
    #[arg(long, env = "FLEET_WATCH_NAMESPACE", default_value = "*")]
    watch_namespace: String,

    /// AppSet reconcile workers
    #[arg(long, env = "FLEET_APPSET_WORKERS", default_value_t = 4)]
    appset_workers: usize,

    /// AdvDeployment reconcile workers
    #[arg(long, env = "FLEET_ADVDEPLOYMENT_WORKERS", default_value_t = 4)]
    advdeployment_workers: usize,

    /// Default revisionHistoryLimit for rendered workloads
    #[arg(long, env = "FLEET_REVISION_HISTORY_LIMIT", default_value_t = 10)]
    revision_history_limit: i32,

    /// Default progressDeadlineSeconds for rendered Deployments
    #[arg(long, env = "FLEET_PROGRESS_DEADLINE_SECONDS", default_value_t = 600)]
    progress_deadline_seconds: i32,

    /// Replace children whose update is rejected as invalid
    #[arg(long, env = "FLEET_RECREATE")]
    recreate: bool,

    /// Default autoscaler CPU utilization target, percent
    #[arg(long, env = "FLEET_METRIC_CPU_UTILIZATION", default_value_t = 70)]
    metric_cpu_utilization: i32,

    /// Default autoscaler memory utilization target, percent
    #[arg(long, env = "FLEET_METRIC_MEMORY_UTILIZATION", default_value_t = 70)]
    metric_memory_utilization: i32,

    /// Log filter directives, e.g. `info,fleet_appset=debug`
    #[arg(long, env = "RUST_LOG")]
    log_filter: Option<String>,

    /// Log line format: `json` or `text`
    #[arg(long, env = "FLEET_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    /// OTLP collector endpoint; traces and metrics stay local when unset
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

/// Pipelines a process runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// AppSet fan-out on the home cluster
    Master,
    /// AdvDeployment pipeline on the local cluster
    Worker,
    /// Both
    All,
}

impl Mode {
    fn runs_master(self) -> bool {
        matches!(self, Mode::Master | Mode::All)
    }

    fn runs_worker(self) -> bool {
        matches!(self, Mode::Worker | Mode::All)
    }
}

/// Member cluster configuration source
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    /// Kubeconfig files in a directory
    Path,
    /// Labeled config maps on the home cluster
    Configmap,
}

impl Cli {
    fn handle_options(&self) -> HandleOptions {
        let exec_timeout = Duration::from_millis(self.exec_timeout_ms);
        HandleOptions {
            exec_timeout,
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            health_check_timeout: exec_timeout,
        }
    }

    fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: CONTROLLER_NAME.to_string(),
            mode: self
                .mode
                .to_possible_value()
                .map(|v| v.get_name().to_string())
                .unwrap_or_default(),
            log_filter: self.log_filter.clone(),
            log_format: self.log_format,
            otlp_endpoint: self.otlp_endpoint.clone(),
        }
    }

    fn adv_config(&self) -> AdvConfig {
        AdvConfig {
            revision_history_limit: self.revision_history_limit,
            progress_deadline_seconds: self.progress_deadline_seconds,
            recreate: self.recreate,
            metric_cpu_utilization: self.metric_cpu_utilization,
            metric_memory_utilization: self.metric_memory_utilization,
        }
    }

    fn config_source(&self, home: &Arc<ClusterHandle>) -> anyhow::Result<Arc<dyn ClusterConfigSource>> {
        let credential_type: CredentialType = self.credential_type.parse()?;
        let source: Arc<dyn ClusterConfigSource> = match self.cluster_source {
            SourceKind::Path => Arc::new(PathConfigSource::new(
                &self.cluster_config_dir,
                self.cluster_config_suffix.clone(),
                credential_type,
            )?),
            SourceKind::Configmap => Arc::new(ConfigMapConfigSource::new(
                home.clone(),
                self.configmap_namespace.clone(),
                parse_labels(&self.configmap_labels)?,
                self.configmap_data_key.clone(),
                self.configmap_status_key.clone(),
            )),
        };
        Ok(source)
    }
}

/// Parse `k=v[,k=v]` into a label map; blank input is empty
fn parse_labels(raw: &str) -> anyhow::Result<BTreeMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
            _ => Err(anyhow::anyhow!("invalid label {:?}, expected key=value", pair)),
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let app_set = serde_yaml::to_string(&AppSet::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize AppSet CRD: {}", e))?;
        let adv = serde_yaml::to_string(&AdvDeployment::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize AdvDeployment CRD: {}", e))?;
        println!("{app_set}---\n{adv}");
        return Ok(());
    }

    let telemetry = init_telemetry(&cli.telemetry_config())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;
    info!(exporting = telemetry.exporting(), "telemetry initialized");

    let result = run(cli).await;
    telemetry.shutdown();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let options = cli.handle_options();
    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let home_source = cli
        .home_kubeconfig
        .clone()
        .map(KubeconfigSource::Path)
        .unwrap_or(KubeconfigSource::Infer);
    let client =
        create_client_with_timeout(&home_source, None, options.exec_timeout, DEFAULT_READ_TIMEOUT)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to home cluster: {}", e))?;
    let home_path = cli
        .home_kubeconfig
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let home = Arc::new(ClusterHandle::new(
        ClusterDescriptor::from_file(HOME_CLUSTER, home_path),
        Arc::new(KubeObjectStore::new(client.clone(), HOME_CLUSTER)),
        options.clone(),
    )?);
    if !home.probe().await {
        anyhow::bail!("home cluster is not healthy");
    }

    let events: Arc<dyn EventPublisher> =
        Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME));

    if cli.mode.runs_master() {
        let registry = Arc::new(
            FleetRegistry::new(
                cli.config_source(&home)?,
                Arc::new(KubeHandleFactory::new(options.clone())),
                RegistryOptions {
                    rebuild_interval: Duration::from_secs(cli.rebuild_interval_secs),
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to build fleet registry: {}", e))?,
        );

        let queue = WorkQueue::new("appset");
        home.watch::<AppSet>(
            queue.clone(),
            default_transform(),
            vec![Arc::new(SpecOrMetaChanged)],
        )?;

        // Child status changes must reach the AppSet, so no predicate here.
        let child_queue = queue.clone();
        let transform = default_transform();
        let hook: BeforeStartHook = Arc::new(move |handle: &Arc<ClusterHandle>| {
            handle.watch::<AdvDeployment>(child_queue.clone(), transform.clone(), Vec::new())
        });
        registry.add_before_start_hook(hook);

        let reconciler = Arc::new(AppSetReconciler::new(
            home.clone(),
            registry.clone(),
            events.clone(),
        ));
        let token = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = registry.start(token).await {
                error!(error = %e, "fleet registry exited");
            }
        });
        tasks.spawn(fleet_queue::run(queue, reconciler, cli.appset_workers, cancel.clone()));
        info!("AppSet pipeline configured");
    }

    if cli.mode.runs_worker() {
        let queue = WorkQueue::new("advdeployment");
        home.watch::<AdvDeployment>(
            queue.clone(),
            default_transform(),
            vec![Arc::new(SpecOrMetaChanged)],
        )?;

        let owned: Vec<Arc<dyn Predicate>> = vec![
            Arc::new(LabelsKeyPredicate::new([CLUSTER_NAME_LABEL, APP_LABEL])),
            Arc::new(NamespacePredicate::new(cli.watch_namespace.clone())),
        ];
        home.watch::<Deployment>(queue.clone(), owner_transform(), owned.clone())?;
        home.watch::<StatefulSet>(queue.clone(), owner_transform(), owned.clone())?;
        home.watch::<Job>(queue.clone(), owner_transform(), owned)?;

        let reconciler = Arc::new(AdvDeploymentReconciler::new(
            home.clone(),
            Arc::new(ManifestRenderer::new()),
            events.clone(),
            cli.adv_config(),
        ));
        tasks.spawn(fleet_queue::run(
            queue,
            reconciler,
            cli.advdeployment_workers,
            cancel.clone(),
        ));
        info!("AdvDeployment pipeline configured");
    }

    let runner = home.clone();
    let token = cancel.clone();
    tasks.spawn(async move {
        if let Err(e) = runner.start(token).await {
            error!(error = %e, "home cluster handle exited");
        }
    });

    info!(mode = ?cli.mode, "fleet operator started");
    shutdown_signal().await;
    info!("shutdown signal received, stopping");
    cancel.cancel();

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "task failed during shutdown");
        }
    }
    info!("fleet operator stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
