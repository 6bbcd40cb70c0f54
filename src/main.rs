use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::lib::{
    config::{AppConfig, CliConfig, FileConfig},
    manager::orchestrator::UpdateOrchestrator,
    registry::{advisories::StaticAdvisoryDb, checker::VersionChecker, resolver::RegistryResolver},
    runtime::{bulk::BulkConfig, gateway::RuntimeGateway, pool::ClientPool},
    scheduler::{
        executor::TaskExecutor,
        scheduler::{SchedulerStores, TaskScheduler},
        types::LogListener,
        window::MaintenanceWindow,
    },
    store::{ContainerStore, MemoryStore},
    worker::{TaskServices, register_default_tasks, stats::HostMonitor, types::TaskRegistry},
};

mod lib {
    pub mod config;
    pub mod error;
    pub mod manager;
    pub mod registry;
    pub mod runtime;
    pub mod scheduler;
    pub mod store;
    pub mod tasks;
    pub mod worker;
}

#[derive(Parser, Debug)]
#[clap(name = "r_keeper", about = "Keeps managed containers on their latest images")]
struct CliArgs {
    /// Path to a TOML config file. Its values override the flags below.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Docker daemon address. Defaults to the local socket.
    #[clap(long)]
    pub docker_host: Option<String>,

    /// Maximum number of tasks executing at once.
    #[clap(long, default_value_t = 10)]
    pub max_concurrent_tasks: usize,

    /// How often the scheduler looks for due tasks, in milliseconds.
    #[clap(long, default_value_t = 1000)]
    pub tick_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli = CliConfig {
        docker_host: cli_args.docker_host,
        max_concurrent_tasks: cli_args.max_concurrent_tasks,
        tick_interval_ms: cli_args.tick_interval_ms,
    };
    let config = AppConfig::resolve(&cli, file_config).context("Invalid configuration")?;

    let pool = ClientPool::connect_docker(config.docker_host.as_deref(), config.gateway.pool_size)
        .context("Failed to connect to the container runtime")?;
    let gateway = RuntimeGateway::new(Arc::new(pool), &config.gateway);
    match gateway.ping(&CancellationToken::new()).await {
        Ok(()) => info!("Container runtime is reachable"),
        Err(e) => warn!("Container runtime not reachable yet: {}", e),
    }

    let resolver = Arc::new(RegistryResolver::new(
        config.registry.endpoints.clone(),
        config.registry.request_timeout,
    ));
    let window = config
        .maintenance_window
        .clone()
        .map(|w| Arc::new(w) as Arc<dyn MaintenanceWindow>);
    let checker = Arc::new(VersionChecker::new(
        resolver,
        Arc::new(StaticAdvisoryDb::new(config.advisories.clone())),
        window,
        config.registry.cache_ttl,
    ));

    let store = Arc::new(MemoryStore::new());
    for container in &config.containers {
        store.save_container(container)?;
    }
    info!("Managing {} containers", config.containers.len());

    let orchestrator = Arc::new(UpdateOrchestrator::new(
        gateway.clone(),
        checker.clone(),
        store.clone(),
        store.clone(),
        config.orchestrator.clone(),
    ));
    let services = Arc::new(TaskServices {
        gateway,
        checker,
        orchestrator,
        containers: store.clone(),
        executions: store.clone(),
        history_retention: config.scheduler.history_retention,
        bulk: BulkConfig {
            max_concurrency: config.gateway.pool_size,
            per_operation_timeout: config.gateway.operation_timeout,
            ..Default::default()
        },
        host: HostMonitor::new(),
    });

    let registry = Arc::new(TaskRegistry::new());
    register_default_tasks(&registry, services);

    let executor = TaskExecutor::new(registry, &config.scheduler);
    let scheduler = TaskScheduler::new(
        config.scheduler.clone(),
        executor,
        SchedulerStores {
            tasks: store.clone(),
            executions: store,
        },
    );
    scheduler.add_listener(Arc::new(LogListener));
    for task in config.tasks {
        scheduler.add_task(task)?;
    }
    scheduler.start()?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    info!("Shutdown requested");
    scheduler.stop(config.scheduler.shutdown_grace).await?;

    Ok(())
}
