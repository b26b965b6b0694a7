use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cube::config::{DbKind, ManagerConfig, SchedulerKind, WorkerConfig};
use cube::manager::{self, Manager};
use cube::shutdown::install_shutdown_handler;
use cube::worker::{self, Worker};

#[derive(Parser, Debug)]
#[command(name = "cube")]
#[command(about = "A lightweight container orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a manager node: accepts tasks, schedules them onto workers,
    /// and reconciles their state.
    Manager {
        /// Hostname or IP address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port on which to listen
        #[arg(long, default_value_t = 5555)]
        port: u16,

        /// Workers on which the manager will schedule tasks
        /// (comma-separated host:port)
        #[arg(long, value_delimiter = ',', default_value = "localhost:5556")]
        workers: Vec<String>,

        /// Scheduling policy
        #[arg(long, value_enum, default_value_t = SchedulerKind::Epvm)]
        scheduler: SchedulerKind,

        /// Datastore for events and tasks
        #[arg(long, value_enum, default_value_t = DbKind::Memory)]
        db_type: DbKind,
    },

    /// Run a worker node: executes tasks as containers and reports their
    /// state.
    Worker {
        /// Hostname or IP address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port on which to listen
        #[arg(long, default_value_t = 5556)]
        port: u16,

        /// Name of the worker; generated when omitted
        #[arg(long)]
        name: Option<String>,

        /// Datastore for tasks
        #[arg(long, value_enum, default_value_t = DbKind::Memory)]
        db_type: DbKind,
    },

    /// Run one worker and one manager in a single process, configured via
    /// the CUBE_* environment variables.
    Demo,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let shutdown = install_shutdown_handler();

    match cli.command {
        Command::Manager {
            host,
            port,
            workers,
            scheduler,
            db_type,
        } => {
            let config = ManagerConfig {
                host,
                port,
                workers,
                scheduler,
                db_type,
            };
            run_manager(config, shutdown).await?;
        }
        Command::Worker {
            host,
            port,
            name,
            db_type,
        } => {
            let config = WorkerConfig {
                host,
                port,
                name: name.unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4())),
                db_type,
            };
            run_worker(config, shutdown).await?;
        }
        Command::Demo => run_demo(shutdown).await?,
    }

    Ok(())
}

async fn run_manager(
    config: ManagerConfig,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(workers = ?config.workers, "starting manager");
    let manager = Arc::new(Manager::new(&config)?);

    tokio::spawn(manager.clone().process_tasks(shutdown.clone()));
    tokio::spawn(manager.clone().update_tasks(shutdown.clone()));
    tokio::spawn(manager.clone().do_health_checks(shutdown.clone()));
    tokio::spawn(manager.clone().update_node_stats(shutdown.clone()));

    let addr = format!("{}:{}", config.host, config.port);
    manager::api::serve(manager, addr, shutdown).await?;
    Ok(())
}

async fn run_worker(
    config: WorkerConfig,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(name = %config.name, "starting worker");
    let worker = Arc::new(Worker::new(&config)?);

    tokio::spawn(worker.clone().run_tasks(shutdown.clone()));
    tokio::spawn(worker.clone().collect_stats(shutdown.clone()));
    tokio::spawn(worker.clone().update_tasks(shutdown.clone()));

    let addr = format!("{}:{}", config.host, config.port);
    worker::api::serve(worker, addr, shutdown).await?;
    Ok(())
}

/// One worker, one manager, one process. Configuration comes from
/// CUBE_WORKER_HOST/CUBE_WORKER_PORT and CUBE_MANAGER_HOST/CUBE_MANAGER_PORT.
async fn run_demo(shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    let worker_host = env_or("CUBE_WORKER_HOST", "localhost");
    let worker_port: u16 = env_or("CUBE_WORKER_PORT", "5556").parse()?;
    let manager_host = env_or("CUBE_MANAGER_HOST", "localhost");
    let manager_port: u16 = env_or("CUBE_MANAGER_PORT", "5555").parse()?;

    tracing::info!("starting cube worker");
    let worker_config = WorkerConfig {
        host: worker_host.clone(),
        port: worker_port,
        ..Default::default()
    };
    let worker = Arc::new(Worker::new(&worker_config)?);
    tokio::spawn(worker.clone().run_tasks(shutdown.clone()));
    tokio::spawn(worker.clone().collect_stats(shutdown.clone()));
    tokio::spawn(worker.clone().update_tasks(shutdown.clone()));
    let worker_addr = format!("{worker_host}:{worker_port}");
    tokio::spawn(worker::api::serve(worker, worker_addr, shutdown.clone()));

    tracing::info!("starting cube manager");
    let manager_config = ManagerConfig {
        host: manager_host.clone(),
        port: manager_port,
        workers: vec![format!("{worker_host}:{worker_port}")],
        ..Default::default()
    };
    let manager = Arc::new(Manager::new(&manager_config)?);
    tokio::spawn(manager.clone().process_tasks(shutdown.clone()));
    tokio::spawn(manager.clone().update_tasks(shutdown.clone()));
    tokio::spawn(manager.clone().do_health_checks(shutdown.clone()));
    tokio::spawn(manager.clone().update_node_stats(shutdown.clone()));

    let manager_addr = format!("{manager_host}:{manager_port}");
    manager::api::serve(manager, manager_addr, shutdown).await?;
    Ok(())
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
