// Kubernetes Operator binary
use anyhow::{Context as _, Result};
use appctl::config::ConfigLoader;
use appctl::http_server::{self, ApiState};
use appctl::logging::init_logging;
use appctl::operator::{self, AppDeployment, ClusterApi, Context, KubeCluster, Reconciler};
use appctl::WatchCache;
use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "appctl-operator", version, about = "AppDeployment operator")]
struct Cli {
    /// TOML configuration file (default: ./appctl.toml when present)
    #[arg(long, short, env = "APPCTL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller, watch cache and HTTP API
    Run {
        /// Run only the controller
        #[arg(long)]
        no_api_server: bool,
    },
    /// Print the AppDeployment CustomResourceDefinition as YAML
    Crd,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Crd => {
            print!("{}", serde_yaml_ng::to_string(&AppDeployment::crd())?);
            Ok(())
        }
        Command::Run { no_api_server } => run(cli.config, no_api_server).await,
    }
}

async fn run(config_file: Option<PathBuf>, no_api_server: bool) -> Result<()> {
    let config = ConfigLoader::new()
        .load_from_file(config_file)
        .load_from_env()
        .build()?;
    let _log_guard = init_logging(&config.logging, "appctl-operator")?;

    info!("Starting AppDeployment operator");

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(client.clone()));
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("🛑 Shutdown requested");
        shutdown.cancel();
    });

    let namespace = config.server.namespace.clone();

    // The watch cache only feeds the HTTP API
    let front_door = (!no_api_server).then(|| {
        let cache = Arc::new(WatchCache::new(
            cluster.clone(),
            namespace.clone(),
            config.cache.reconnect_delay(),
        ));
        let cache_task = cache.spawn(cancel.clone());
        let state = ApiState::new(cluster.clone(), cache, namespace.clone());
        let server_task =
            http_server::spawn_server(config.server.bind_addr, state, cancel.clone());
        (cache_task, server_task)
    });

    let ctx = Arc::new(Context::new(
        Reconciler::new(cluster, config.controller.retry_policy()),
        cancel.clone(),
        config.controller.settings(),
    ));
    let controller_result = operator::run_controller(client, &namespace, ctx).await;

    // The controller only returns on shutdown or failure; stop the rest too.
    cancel.cancel();
    let mut server_result = Ok(());
    if let Some((cache_task, server_task)) = front_door {
        match server_task.await {
            Ok(result) => server_result = result.context("HTTP API server failed"),
            Err(e) => error!("HTTP API server task failed: {}", e),
        }
        if let Err(e) = cache_task.await {
            error!("Watch cache task failed: {}", e);
        }
    }

    controller_result?;
    server_result?;
    info!("Operator stopped");
    Ok(())
}
