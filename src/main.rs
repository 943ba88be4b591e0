//! record-sync - Reconciles a local record store with a paginated upstream API
//!
//! This is the main entry point for the record-sync application.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use record_sync::config::Config;
use record_sync::database::{Database, SqliteDatabase};
use record_sync::server::{AppState, Server};
use record_sync::sync::{register_entities, Orchestrator, RateLimiter, SyncScheduler, UpstreamClient};
use record_sync::telemetry::init_tracing;

/// record-sync - Reconciles a local record store with a paginated upstream API
#[derive(Parser, Debug)]
#[command(name = "record-sync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "RECORD_SYNC_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler and admin server until Ctrl-C or SIGTERM (default)
    Serve,

    /// Run one sync type or job and print the resulting statuses
    Run {
        /// Composite sync type (daily, weekly, historical, ...) or job name
        sync_type: String,

        /// Restrict the run to a year
        #[arg(long)]
        year: Option<i32>,
    },

    /// Print the persisted run history
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    init_tracing(&config.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting record-sync");

    let database: Arc<dyn Database> = Arc::new(SqliteDatabase::new(&config.database.path).await?);
    info!(path = %config.database.path, "Database initialized");

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config, database).await,
        Command::Run { sync_type, year } => run_once(&config, database, &sync_type, year).await,
        Command::Status => {
            let statuses = database.all_run_statuses().await?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
            Ok(())
        }
    }
}

/// Wire the upstream client, rate limiter and entity synchronizers
fn build_orchestrator(config: &Config, database: Arc<dyn Database>) -> anyhow::Result<Orchestrator> {
    let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));

    let orchestrator = Orchestrator::new(&config.orchestrator).with_history(database.clone());
    let count = register_entities(&orchestrator, config, upstream, limiter, database);

    info!(
        entities = count,
        upstream = %config.upstream.base_url,
        "Orchestrator initialized"
    );
    Ok(orchestrator)
}

async fn serve(config: &Config, database: Arc<dyn Database>) -> anyhow::Result<()> {
    let orchestrator = Arc::new(build_orchestrator(config, database.clone())?);
    match orchestrator.load_history().await {
        Ok(restored) => info!(restored, "Run history loaded"),
        Err(e) => warn!(error = %e, "Failed to load run history"),
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler = config.scheduler.enabled.then(|| {
        tokio::spawn(
            SyncScheduler::new(config.scheduler.clone(), orchestrator.clone(), shutdown_rx).run(),
        )
    });

    let result: anyhow::Result<()> = if config.server.enabled {
        info!(
            host = %config.server.host,
            port = %config.server.port,
            "Starting admin server"
        );
        let server = Server::new(config.server.clone(), AppState::new(orchestrator.clone()));
        server.run(shutdown_signal()).await.map_err(Into::into)
    } else {
        shutdown_signal().await;
        Ok(())
    };

    let _ = shutdown_tx.send(());
    if let Some(handle) = scheduler {
        let _ = handle.await;
    }

    if let Err(e) = database.flush().await {
        error!(error = %e, "Failed to flush database");
    }

    info!("record-sync shutdown complete");
    result
}

async fn run_once(
    config: &Config,
    database: Arc<dyn Database>,
    sync_type: &str,
    year: Option<i32>,
) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(config, database)?;
    if !orchestrator.is_known_sync_type(sync_type) {
        anyhow::bail!("Unknown sync type: {}", sync_type);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.cancel();
    });

    let result = orchestrator
        .trigger_sync_for_year(sync_type, year, cancel)
        .await;

    println!(
        "{}",
        serde_json::to_string_pretty(&orchestrator.get_all_statuses())?
    );

    match result {
        Ok(statuses) => {
            info!(sync_type = %sync_type, jobs = statuses.len(), "Sync finished");
            Ok(())
        }
        Err(e) => {
            error!(sync_type = %sync_type, error = %e, "Sync failed");
            Err(e.into())
        }
    }
}

/// Load configuration from file or environment
fn load_config(args: &Args) -> anyhow::Result<Config> {
    match &args.config {
        Some(path) => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from file: {}", path);
            Config::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
        None => {
            eprintln!("Loading configuration from environment variables");
            Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
    }
}

/// Create a future that resolves when a shutdown signal is received
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
