//! gd - image-generation task worker
//!
//! CLI entry point: runs the worker loop, reports task counts, and cleans
//! up aged-out terminal tasks.

use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use gendaemon::cli::{Cli, Command};
use gendaemon::config::Config;
use gendaemon::provider::RunningHubClient;
use gendaemon::storage::HttpObjectStorage;
use gendaemon::worker::{ComponentFactory, Components, Worker};
use genstore::{SqliteTaskStore, TaskStore};

fn setup_logging(cli_log_level: Option<&str>) -> Result<()> {
    let level = match cli_log_level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Some(Command::Run { once }) => cmd_run(config, once).await,
        Some(Command::Status) => cmd_status(&config),
        Some(Command::Cleanup { days }) => cmd_cleanup(&config, days),
        None => cmd_run(config, false).await,
    }
}

/// Builds the component set the worker talks to; also used to rebuild
/// everything during loop-level recovery
fn component_factory(config: &Config) -> ComponentFactory {
    let config = config.clone();
    Box::new(move || {
        let store = SqliteTaskStore::open(&config.store.db_path)
            .context("Failed to open task store")?
            .with_max_age_days(config.store.max_age_days as i64);
        let provider = RunningHubClient::from_config(&config.provider)
            .map_err(|e| eyre::eyre!("Failed to create provider client: {e}"))?;
        let storage = HttpObjectStorage::from_config(&config.storage)
            .map_err(|e| eyre::eyre!("Failed to create storage client: {e}"))?;
        Ok(Components {
            store: Arc::new(store) as Arc<dyn TaskStore>,
            provider: Arc::new(provider),
            storage: Arc::new(storage),
        })
    })
}

/// Run the worker loop until interrupted
async fn cmd_run(config: Config, once: bool) -> Result<()> {
    debug!(once, "cmd_run: called");
    config.validate()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let factory = component_factory(&config);
    let mut worker = Worker::new(config, factory, shutdown_rx)?;

    if once {
        info!("Running a single worker iteration");
        return worker.run_iteration().await;
    }

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    worker.run().await
}

/// Show task counts per status
fn cmd_status(config: &Config) -> Result<()> {
    debug!("cmd_status: called");
    if !config.store.db_path.exists() {
        println!("No task store found at {}", config.store.db_path.display());
        println!("Has the worker run yet?");
        return Ok(());
    }

    let store = SqliteTaskStore::open(&config.store.db_path).context("Failed to open task store")?;
    let stats = store.task_stats()?;

    println!("Task counts");
    println!("-----------");
    if stats.is_empty() {
        println!("(no tasks)");
        return Ok(());
    }
    for (status, count) in &stats {
        println!("{:<10} {}", status, count);
    }
    Ok(())
}

/// Delete aged-out terminal tasks
fn cmd_cleanup(config: &Config, days: Option<u32>) -> Result<()> {
    debug!(?days, "cmd_cleanup: called");
    if !config.store.db_path.exists() {
        println!("No task store found at {}", config.store.db_path.display());
        return Ok(());
    }

    let days = days.unwrap_or(config.store.max_age_days) as i64;
    let store = SqliteTaskStore::open(&config.store.db_path).context("Failed to open task store")?;
    let removed = store.cleanup_old_tasks(days)?;

    println!("Removed {} task(s) older than {} days", removed, days);
    Ok(())
}
