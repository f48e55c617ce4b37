//! Consumer Pool: `N` supervised workers draining a shared `EventStream`
//! into a `Sink` with at-least-once delivery.
//!
//! Grounded in `archivist.py`'s `events_consumer` (the per-worker Init /
//! Recovery / Main loop) and a watchdog loop that notices dead workers and
//! respawns them, the same supervisor shape `TaskScheduler` uses for its
//! own worker set, applied here to stream consumers instead of scheduled
//! jobs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use core::sink::{Sink, StoreOutcome};
use core::stream::EventStream;
use core::utils::calculate_backoff_delay;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Settings a single worker needs; cloned once per spawned task.
#[derive(Clone)]
pub struct WorkerConfig {
    pub stream_name: String,
    pub destination: String,
    pub consumer_group: String,
    pub batch_size: usize,
    pub block_timeout_ms: u64,
    pub recover_idle_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

/// Runs the Init / Recovery / Main loop for one named consumer until the
/// shared stop flag is set, or once through in burst mode.
async fn run_worker(
    consumer_name: String,
    config: WorkerConfig,
    stream: Arc<dyn EventStream>,
    sink: Arc<dyn Sink>,
    stop: Arc<AtomicBool>,
    burst: bool,
) {
    info!(consumer = %consumer_name, "worker starting");

    if let Err(e) = stream
        .ensure_group(&config.stream_name, &config.consumer_group)
        .await
    {
        error!(consumer = %consumer_name, error = %e, "failed to ensure consumer group, worker exiting");
        return;
    }
    if let Err(e) = sink.ensure_destination(&config.destination).await {
        error!(consumer = %consumer_name, error = %e, "failed to ensure sink destination, worker exiting");
        return;
    }

    let mut attempt: u32 = 0;

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        // Recovery loop: drain pending entries before touching new ones, so
        // a crashed sibling's work gets finished ahead of fresh reads.
        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            match stream
                .recover_pending(
                    &config.stream_name,
                    &config.consumer_group,
                    &consumer_name,
                    config.recover_idle_ms,
                    config.batch_size,
                )
                .await
            {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => {
                    debug!(consumer = %consumer_name, count = batch.len(), "recovered pending entries");
                    process_batch(&consumer_name, &config, &stream, &sink, batch, true).await;
                    attempt = 0;
                }
                Err(e) => {
                    attempt += 1;
                    warn!(consumer = %consumer_name, error = %e, attempt, "recovery scan failed");
                    backoff_sleep(&config, attempt).await;
                    break;
                }
            }
        }

        if stop.load(Ordering::SeqCst) {
            break;
        }

        match stream
            .read_new(
                &config.stream_name,
                &config.consumer_group,
                &consumer_name,
                config.batch_size,
                config.block_timeout_ms,
            )
            .await
        {
            Ok(batch) => {
                attempt = 0;
                if !batch.is_empty() {
                    process_batch(&consumer_name, &config, &stream, &sink, batch, false).await;
                }
            }
            Err(e) => {
                attempt += 1;
                warn!(consumer = %consumer_name, error = %e, attempt, "stream read failed");
                backoff_sleep(&config, attempt).await;
            }
        }

        if burst {
            break;
        }
    }

    info!(consumer = %consumer_name, "worker stopped");
}

async fn backoff_sleep(config: &WorkerConfig, attempt: u32) {
    let delay = calculate_backoff_delay(attempt, config.backoff_base_ms, config.backoff_cap_ms);
    tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
}

/// Stores a batch and acknowledges only the entries the sink confirmed.
/// An `Err` from the sink leaves the entire batch pending, to be picked up
/// again by the recovery loop once it ages past `recover_idle_ms`.
async fn process_batch(
    consumer_name: &str,
    config: &WorkerConfig,
    stream: &Arc<dyn EventStream>,
    sink: &Arc<dyn Sink>,
    batch: Vec<core::model::StreamEntry>,
    recovery: bool,
) {
    let outcomes = match sink.store(&config.destination, &batch).await {
        Ok(outcomes) => outcomes,
        Err(e) => {
            warn!(
                consumer = %consumer_name,
                error = %e,
                recovery,
                batch_size = batch.len(),
                "sink raised storing batch, leaving it unacknowledged"
            );
            return;
        }
    };

    for outcome in outcomes {
        match outcome {
            StoreOutcome::Stored { message_id } => {
                if let Err(e) = stream
                    .ack(&config.stream_name, &config.consumer_group, &message_id)
                    .await
                {
                    warn!(consumer = %consumer_name, message_id = %message_id, error = %e, "ack failed");
                }
            }
            StoreOutcome::Rejected { message_id, reason } => {
                warn!(
                    consumer = %consumer_name,
                    message_id = %message_id,
                    reason = %reason,
                    "sink rejected entry, leaving it pending for recovery"
                );
            }
        }
    }
}

struct LiveWorker {
    consumer_name: String,
    handle: JoinHandle<()>,
}

/// Supervises `N` workers against one stream/group/destination triple.
pub struct ConsumerPool {
    stream: Arc<dyn EventStream>,
    sink: Arc<dyn Sink>,
    config: WorkerConfig,
    worker_count: usize,
    status: Mutex<PoolStatus>,
    workers: Mutex<Vec<LiveWorker>>,
    stop: Arc<AtomicBool>,
    spawned: AtomicUsize,
}

impl ConsumerPool {
    pub fn new(
        stream: Arc<dyn EventStream>,
        sink: Arc<dyn Sink>,
        config: WorkerConfig,
        worker_count: usize,
    ) -> Arc<Self> {
        Arc::new(ConsumerPool {
            stream,
            sink,
            config,
            worker_count,
            status: Mutex::new(PoolStatus::Idle),
            workers: Mutex::new(Vec::new()),
            stop: Arc::new(AtomicBool::new(false)),
            spawned: AtomicUsize::new(0),
        })
    }

    pub async fn status(&self) -> PoolStatus {
        *self.status.lock().await
    }

    fn next_consumer_name(&self) -> String {
        let n = self.spawned.fetch_add(1, Ordering::SeqCst);
        format!("consumer-{n}-{}", Uuid::new_v4())
    }

    fn spawn_one(self: &Arc<Self>, burst: bool) -> LiveWorker {
        let consumer_name = self.next_consumer_name();
        let handle = tokio::spawn(run_worker(
            consumer_name.clone(),
            self.config.clone(),
            self.stream.clone(),
            self.sink.clone(),
            self.stop.clone(),
            burst,
        ));
        LiveWorker { consumer_name, handle }
    }

    /// Spawns the configured worker count and, in non-burst mode, starts a
    /// watchdog that replaces workers which exit unexpectedly. Returns once
    /// every worker has finished (burst mode) or the caller drives shutdown
    /// via `force_stop` (continuous mode).
    pub async fn start(self: &Arc<Self>, burst: bool) {
        {
            let mut status = self.status.lock().await;
            *status = PoolStatus::Running;
        }
        self.stop.store(false, Ordering::SeqCst);

        {
            let mut workers = self.workers.lock().await;
            for _ in 0..self.worker_count {
                workers.push(self.spawn_one(burst));
            }
        }

        if burst {
            self.run_until_drained().await;
            let mut status = self.status.lock().await;
            *status = PoolStatus::Stopped;
            return;
        }

        self.watchdog_loop().await;
    }

    /// Burst mode: wait for every spawned worker to finish its single pass.
    async fn run_until_drained(self: &Arc<Self>) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().await;
            workers.drain(..).map(|w| w.handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Continuous mode: periodically prune dead workers and, while RUNNING,
    /// top the live set back up to `worker_count`.
    async fn watchdog_loop(self: &Arc<Self>) {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(3));
        loop {
            interval.tick().await;

            let status = *self.status.lock().await;
            if status == PoolStatus::Stopped {
                break;
            }

            let mut workers = self.workers.lock().await;
            workers.retain(|w| {
                let finished = w.handle.is_finished();
                if finished {
                    debug!(consumer = %w.consumer_name, "pruning dead worker");
                }
                !finished
            });

            if status == PoolStatus::Running {
                while workers.len() < self.worker_count {
                    workers.push(self.spawn_one(false));
                }
            }

            if status == PoolStatus::Stopping && workers.is_empty() {
                drop(workers);
                let mut status = self.status.lock().await;
                *status = PoolStatus::Stopped;
                break;
            }
        }
    }

    /// Sets the shared stop flag so every worker exits its loop after its
    /// current batch, without forcibly aborting anything.
    pub async fn stop(&self) {
        {
            let mut status = self.status.lock().await;
            *status = PoolStatus::Stopping;
        }
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Sets the stop flag, waits briefly for workers to exit on their own,
    /// then aborts anything still running.
    pub async fn force_stop(&self, grace_period: tokio::time::Duration) {
        self.stop().await;
        tokio::time::sleep(grace_period).await;

        let mut workers = self.workers.lock().await;
        for worker in workers.iter() {
            if !worker.handle.is_finished() {
                warn!(consumer = %worker.consumer_name, "force-aborting worker past grace period");
                worker.handle.abort();
            }
        }
        workers.clear();

        let mut status = self.status.lock().await;
        *status = PoolStatus::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use core::model::StreamEntry;
    use core::stream_sqlite::SqliteEventStream;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct CountingSink {
        stored: Arc<StdAtomicUsize>,
    }

    #[async_trait]
    impl Sink for CountingSink {
        async fn ping(&self) -> core::error::Result<()> {
            Ok(())
        }

        async fn ensure_destination(&self, _name: &str) -> core::error::Result<()> {
            Ok(())
        }

        async fn store(
            &self,
            _destination: &str,
            entries: &[StreamEntry],
        ) -> core::error::Result<Vec<StoreOutcome>> {
            self.stored.fetch_add(entries.len(), Ordering::SeqCst);
            Ok(entries
                .iter()
                .map(|e| StoreOutcome::Stored {
                    message_id: e.message_id.clone(),
                })
                .collect())
        }
    }

    fn worker_config(stream_name: &str) -> WorkerConfig {
        WorkerConfig {
            stream_name: stream_name.to_string(),
            destination: "events".to_string(),
            consumer_group: "grp".to_string(),
            batch_size: 10,
            block_timeout_ms: 50,
            recover_idle_ms: 10,
            backoff_base_ms: 10,
            backoff_cap_ms: 100,
        }
    }

    #[tokio::test]
    async fn burst_mode_drains_every_pending_entry_exactly_once_each() {
        let dir = tempfile::tempdir().unwrap();
        let stream: Arc<dyn EventStream> = Arc::new(
            SqliteEventStream::open(dir.path().join("s.db"))
                .await
                .unwrap()
                .with_poll_interval_ms(5),
        );
        for i in 0..10 {
            stream
                .append("events", json!({"i": i}))
                .await
                .unwrap();
        }

        let stored = Arc::new(StdAtomicUsize::new(0));
        let sink: Arc<dyn Sink> = Arc::new(CountingSink {
            stored: stored.clone(),
        });

        let pool = ConsumerPool::new(stream, sink, worker_config("events"), 5);
        pool.start(true).await;

        assert_eq!(stored.load(Ordering::SeqCst), 10);
        assert_eq!(pool.status().await, PoolStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_flag_halts_a_continuous_worker() {
        let dir = tempfile::tempdir().unwrap();
        let stream: Arc<dyn EventStream> = Arc::new(
            SqliteEventStream::open(dir.path().join("s.db"))
                .await
                .unwrap()
                .with_poll_interval_ms(5),
        );
        let stored = Arc::new(StdAtomicUsize::new(0));
        let sink: Arc<dyn Sink> = Arc::new(CountingSink {
            stored: stored.clone(),
        });

        let pool = ConsumerPool::new(stream, sink, worker_config("events"), 2);
        let pool_clone = pool.clone();
        let handle = tokio::spawn(async move {
            pool_clone.start(false).await;
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        pool.force_stop(tokio::time::Duration::from_millis(50)).await;

        tokio::time::timeout(tokio::time::Duration::from_secs(2), handle)
            .await
            .ok();

        assert_eq!(pool.status().await, PoolStatus::Stopped);
    }
}
