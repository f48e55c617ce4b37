//! Consumer Pool binary: drains a shared event stream into a sink with
//! at-least-once delivery.
//!
//! Wires together the SQLite-backed `EventStream`, the reference `Sink`,
//! and the `ConsumerPool` supervisor, then runs until a shutdown signal
//! arrives, following the same config-load-then-run shape as the
//! scheduler binary.

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod config;
mod pool;
mod sink_reference;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use core::sink::Sink;
use core::stream::EventStream;
use core::stream_sqlite::SqliteEventStream;
use tracing::info;

use config::ConfigManager;
use pool::{ConsumerPool, WorkerConfig};
use sink_reference::ReferenceSink;

/// Command-line arguments for the consumers binary.
#[derive(Parser, Debug)]
#[command(name = "consumers")]
#[command(about = "Supervised pool of event-stream consumers", long_about = None)]
struct CliArgs {
    /// Path to a directory containing consumers.toml, or a direct path to it.
    #[arg(value_name = "CONFIG")]
    config_path: PathBuf,

    /// Run every worker through a single recovery + read pass, then exit
    /// instead of running until a shutdown signal arrives.
    #[arg(long)]
    burst: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("consumers=info,core=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli_args = CliArgs::parse();
    info!(config_path = %cli_args.config_path.display(), burst = cli_args.burst, "starting consumer pool");

    let mut config_manager = ConfigManager::new(cli_args.config_path);
    config_manager.load_config().await?;
    let config = config_manager.config.clone().expect("config loaded");

    let stream: Arc<dyn EventStream> = Arc::new(
        SqliteEventStream::open(&config.events_database_path)
            .await
            .with_context(|| format!("failed to open {}", config.events_database_path))?,
    );
    let sink: Arc<dyn Sink> = Arc::new(
        ReferenceSink::open(&config.sink_database_path)
            .await
            .with_context(|| format!("failed to open {}", config.sink_database_path))?,
    );

    let worker_config = WorkerConfig {
        stream_name: config.stream_name.clone(),
        destination: config.stream_name.clone(),
        consumer_group: config.consumer_group.clone(),
        batch_size: config.batch_size,
        block_timeout_ms: config.block_timeout_ms,
        recover_idle_ms: config.recover_idle_ms,
        backoff_base_ms: config.backoff_base_ms,
        backoff_cap_ms: config.backoff_cap_ms,
    };

    let pool = ConsumerPool::new(stream, sink, worker_config, config.worker_count);

    if cli_args.burst {
        pool.start(true).await;
        info!("burst pass complete");
        return Ok(());
    }

    let pool_handle = pool.clone();
    let run_handle = tokio::spawn(async move {
        pool_handle.start(false).await;
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
    info!("shutting down consumer pool");
    pool.force_stop(tokio::time::Duration::from_secs(
        config.graceful_shutdown_timeout_seconds,
    ))
    .await;
    run_handle.abort();

    Ok(())
}

#[cfg(test)]
mod cli_tests {
    #[test]
    fn cli_args_parse_minimal_config_path() {
        use super::CliArgs;
        use clap::Parser;
        let args = CliArgs::parse_from(["consumers", "/tmp/consumers.toml"]);
        assert_eq!(args.config_path, std::path::PathBuf::from("/tmp/consumers.toml"));
        assert!(!args.burst);
    }

    #[test]
    fn burst_flag_parses() {
        use super::CliArgs;
        use clap::Parser;
        let args = CliArgs::parse_from(["consumers", "/tmp/consumers.toml", "--burst"]);
        assert!(args.burst);
    }
}
