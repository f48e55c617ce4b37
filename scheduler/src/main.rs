//! Scheduler binary: the durable, at-most-one-execution-per-task engine.
//!
//! Wires together the Task Store, the SQLite-backed Work Broker, the Task
//! Registry, and the Scheduler Engine, then runs the broker's ticker
//! alongside a periodic `maintain_tasks` sweep until a shutdown signal
//! arrives.

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod broker_sqlite;
mod config;
mod engine;
mod task_types;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use core::registry::TaskRegistry;
use core::store::SqliteTaskStore;
use core::stream_sqlite::SqliteEventStream;
use tokio::time::Duration;
use tracing::{error, info};

use broker_sqlite::SqliteBroker;
use config::ConfigManager;
use engine::{Engine, EngineJobRunner};
use task_types::{EchoTask, FetchEventsTask};

/// Command-line arguments for the scheduler binary.
#[derive(Parser, Debug)]
#[command(name = "scheduler")]
#[command(about = "Durable task scheduler for the grimoire control plane", long_about = None)]
struct CliArgs {
    /// Path to a directory containing scheduler.toml, or a direct path to it.
    #[arg(value_name = "CONFIG")]
    config_path: PathBuf,

    /// Run `maintain_tasks` once at startup and exit, without starting the
    /// ticker. Useful for operators verifying reconciliation out of band.
    #[arg(long)]
    reconcile_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("scheduler=info,core=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli_args = CliArgs::parse();
    info!(config_path = %cli_args.config_path.display(), "starting scheduler");

    let mut config_manager = ConfigManager::new(cli_args.config_path);
    config_manager.load_config().await?;
    let config = config_manager.config.clone().expect("config loaded");

    let store: Arc<dyn core::store::TaskStore> = Arc::new(
        SqliteTaskStore::open(&config.database_path)
            .await
            .with_context(|| format!("failed to open {}", config.database_path))?,
    );
    let broker = Arc::new(
        SqliteBroker::open(&config.database_path)
            .await
            .context("failed to open broker database")?,
    );
    let event_stream: Arc<dyn core::stream::EventStream> = Arc::new(
        SqliteEventStream::open(&config.events_database_path)
            .await
            .context("failed to open shared event stream")?,
    );

    let mut registry = TaskRegistry::new();
    registry.register(Arc::new(EchoTask))?;
    registry.register(Arc::new(FetchEventsTask::new(
        event_stream.clone(),
        config.events_stream_name.clone(),
    )))?;
    let registry = Arc::new(registry);

    let engine = Engine::new(store.clone(), broker.clone(), registry.clone(), config.clone());
    let runner = EngineJobRunner::new(
        engine.clone(),
        store.clone(),
        registry.clone(),
        broker.clone(),
        config.job_timeout_seconds,
    );

    info!(
        task_types = ?engine.list_task_types(),
        "task registry populated"
    );

    // Reconciliation runs once before anything else, exactly as §4.D
    // requires it to run "once at Scheduler startup".
    match engine.maintain_tasks().await {
        Ok(n) => info!(repaired = n, "startup reconciliation complete"),
        Err(e) => error!(error = %e, "startup reconciliation failed"),
    }

    if cli_args.reconcile_once {
        return Ok(());
    }

    let ticker = broker.spawn_ticker(runner, Duration::from_millis(500));

    let maintenance_engine = engine.clone();
    let maintenance_interval = Duration::from_secs(config.maintenance_interval_seconds);
    let maintenance_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(maintenance_interval);
        interval.tick().await; // first tick fires immediately; skip it, we already swept above
        loop {
            interval.tick().await;
            match maintenance_engine.maintain_tasks().await {
                Ok(n) if n > 0 => info!(repaired = n, "periodic reconciliation repaired tasks"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "periodic reconciliation failed"),
            }
        }
    });

    let shutdown_signal = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate()).unwrap();
            let mut sigint = signal(SignalKind::interrupt()).unwrap();
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.unwrap();
            info!("received Ctrl+C");
        }
    };

    shutdown_signal.await;
    info!("shutting down scheduler");
    maintenance_handle.abort();
    ticker.abort();

    Ok(())
}

#[cfg(test)]
mod cli_tests {
    #[test]
    fn cli_args_parse_minimal_config_path() {
        use super::CliArgs;
        use clap::Parser;
        let args = CliArgs::parse_from(["scheduler", "/tmp/scheduler.toml"]);
        assert_eq!(args.config_path, std::path::PathBuf::from("/tmp/scheduler.toml"));
        assert!(!args.reconcile_once);
    }
}
