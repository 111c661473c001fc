//! KernelManager operator - runs interactive compute kernels as Kubernetes pods

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Config as ControllerRuntimeConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt, ResourceExt};

use kernel_manager::config::{ControllerArgs, ControllerConfig};
use kernel_manager::controller::{error_policy, reconcile, Context, KubeStore};
use kernel_manager::crd::KernelManager;
use kernel_manager::retry::{retry_with_backoff, RetryConfig};
use kernel_manager::telemetry::{init_tracing, LogFormat};
use kernel_manager::{FIELD_MANAGER, MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// KernelManager - CRD-driven Kubernetes operator for compute kernels
#[derive(Parser, Debug)]
#[command(name = "kernel-manager", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log output format
    #[arg(long, value_enum, env = "KM_LOG_FORMAT", default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Controller flags, used when no subcommand is given
    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches KernelManager resources and the pods they own, and keeps one
    /// kernel pod per KernelManager converged with its template.
    Controller(ControllerArgs),

    /// List KernelManagers and their phase
    List(ListArgs),
}

/// List mode arguments
#[derive(Args, Debug)]
struct ListArgs {
    /// Namespace to list; all namespaces when omitted
    #[arg(short, long)]
    namespace: Option<String>,

    /// Number of items fetched per API request
    #[arg(long, default_value_t = 100)]
    page_size: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&KernelManager::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_tracing(cli.log_format)?;

    match cli.command {
        Some(Commands::List(args)) => run_list(args).await,
        Some(Commands::Controller(args)) => run_controller(args.into()).await,
        None => run_controller(cli.controller.into()).await,
    }
}

/// Ensure the KernelManager CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply so
/// the schema always matches the running binary.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = KernelManager::crd();
    let name = crd.name_any();
    let patch = Patch::Apply(&crd);

    tracing::info!(crd = %name, "Installing KernelManager CRD...");
    retry_with_backoff(&RetryConfig::with_max_attempts(5), "install_crd", || {
        crds.patch(&name, &params, &patch)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install KernelManager CRD: {}", e))?;

    tracing::info!("KernelManager CRD installed/updated");
    Ok(())
}

/// Run the controller until a shutdown signal arrives
async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    tracing::info!("KernelManager controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let (kernel_managers, pods): (Api<KernelManager>, Api<Pod>) = match &config.namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    let concurrency = config.concurrency;
    tracing::info!(
        namespace = config.namespace.as_deref().unwrap_or("*"),
        concurrency,
        "Starting KernelManager controller"
    );

    let ctx = Arc::new(Context::from_client(client, config));
    let pod_watch =
        WatcherConfig::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}"));

    Controller::new(kernel_managers, WatcherConfig::default())
        .owns(pods, pod_watch)
        .with_config(ControllerRuntimeConfig::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(kernel_manager = %obj.name, ?action, "Reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("KernelManager controller stopped");
    Ok(())
}

/// Print a table of KernelManagers
async fn run_list(args: ListArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let store = KubeStore::new(client);

    let items = store
        .list_all_kernel_managers(args.namespace.as_deref(), args.page_size.max(1))
        .await?;

    println!(
        "{:<20} {:<32} {:<12} {:<40} {}",
        "NAMESPACE", "NAME", "PHASE", "WORKLOAD", "READY"
    );
    for km in &items {
        let status = km.status.clone().unwrap_or_default();
        let ready = status
            .container_state
            .as_ref()
            .map(|c| c.ready)
            .unwrap_or(false);
        println!(
            "{:<20} {:<32} {:<12} {:<40} {}",
            km.namespace().unwrap_or_default(),
            km.name_any(),
            status.phase,
            status.workload_name.as_deref().unwrap_or("-"),
            ready
        );
    }
    Ok(())
}
