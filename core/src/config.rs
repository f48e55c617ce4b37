//! Configuration types shared by the scheduler and the consumer pool.
//!
//! Both binaries load a single TOML file into one of the structs below.
//! Optional fields carry a `#[serde(default = "default_x")]` so a minimal
//! config file only needs to name what it wants to override.

use serde::{Deserialize, Serialize};

use crate::defaults::*;

/// Configuration for the `scheduler` binary, loaded from `scheduler.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Path to the scheduler's SQLite database file.
    #[serde(default = "default_scheduler_database_path")]
    pub database_path: String,

    /// Default queue new tasks land on absent a type-specific override.
    #[serde(default = "default_queue")]
    pub default_queue: String,

    /// Default recurrence interval for new tasks, in seconds (0 = run once).
    #[serde(default = "default_job_interval")]
    pub default_job_interval_seconds: i64,

    /// Default retry budget for new tasks.
    #[serde(default = "default_job_max_retries")]
    pub default_job_max_retries: u32,

    /// TTL applied to a job's stored result once it reaches a terminal state.
    #[serde(default = "default_job_result_ttl_seconds")]
    pub job_result_ttl_seconds: i64,

    /// Wall-clock budget given to a single job attempt.
    #[serde(default = "default_job_timeout_seconds")]
    pub job_timeout_seconds: i64,

    /// How often `maintain_tasks` sweeps the store for drift against the broker.
    #[serde(default = "default_maintenance_interval_seconds")]
    pub maintenance_interval_seconds: u64,

    /// Grace period a RECOVERY task waits before being retried.
    #[serde(default = "default_recovery_delay_seconds")]
    pub recovery_delay_seconds: i64,

    /// Path to the SQLite file backing the shared event stream that
    /// fetcher-shaped job functions publish into. Must match the consumer
    /// pool's `events_database_path` for the two processes to share a stream.
    #[serde(default = "default_events_database_path")]
    pub events_database_path: String,

    /// Name of the event stream job functions publish to.
    #[serde(default = "default_stream_name")]
    pub events_stream_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            database_path: default_scheduler_database_path(),
            default_queue: default_queue(),
            default_job_interval_seconds: default_job_interval(),
            default_job_max_retries: default_job_max_retries(),
            job_result_ttl_seconds: default_job_result_ttl_seconds(),
            job_timeout_seconds: default_job_timeout_seconds(),
            maintenance_interval_seconds: default_maintenance_interval_seconds(),
            recovery_delay_seconds: default_recovery_delay_seconds(),
            events_database_path: default_events_database_path(),
            events_stream_name: default_stream_name(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.database_path.trim().is_empty() {
            return Err("database_path must not be empty".to_string());
        }
        if self.job_timeout_seconds <= 0 {
            return Err("job_timeout_seconds must be positive".to_string());
        }
        if self.maintenance_interval_seconds == 0 {
            return Err("maintenance_interval_seconds must be positive".to_string());
        }
        Ok(())
    }
}

/// Configuration for the `consumers` binary, loaded from `consumers.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumersConfig {
    /// Path to the SQLite file backing the shared event stream. Must match
    /// the scheduler's `events_database_path` to read what it publishes.
    #[serde(default = "default_events_database_path")]
    pub events_database_path: String,

    /// Path to the reference sink's own SQLite-backed destination file.
    #[serde(default = "default_sink_database_path")]
    pub sink_database_path: String,

    /// Name of the event stream to consume.
    #[serde(default = "default_stream_name")]
    pub stream_name: String,

    /// Consumer group name shared by every worker in the pool.
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Number of workers in the pool.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Entries requested per read, new or recovered.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Milliseconds a read blocks waiting for new entries.
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,

    /// Milliseconds an entry may sit unacknowledged before another
    /// consumer may claim it.
    #[serde(default = "default_recover_idle_ms")]
    pub recover_idle_ms: u64,

    /// Base delay for exponential backoff after a transient error.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Cap on exponential backoff delay.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// How long to let in-flight batches finish after a shutdown signal.
    #[serde(default = "default_graceful_shutdown_timeout_seconds")]
    pub graceful_shutdown_timeout_seconds: u64,
}

impl Default for ConsumersConfig {
    fn default() -> Self {
        ConsumersConfig {
            events_database_path: default_events_database_path(),
            sink_database_path: default_sink_database_path(),
            stream_name: default_stream_name(),
            consumer_group: default_consumer_group(),
            worker_count: default_worker_count(),
            batch_size: default_batch_size(),
            block_timeout_ms: default_block_timeout_ms(),
            recover_idle_ms: default_recover_idle_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            graceful_shutdown_timeout_seconds: default_graceful_shutdown_timeout_seconds(),
        }
    }
}

impl ConsumersConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be at least 1".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err("backoff_cap_ms must be >= backoff_base_ms".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_defaults_validate() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn consumers_defaults_validate() {
        assert!(ConsumersConfig::default().validate().is_ok());
    }

    #[test]
    fn scheduler_config_round_trips_through_toml() {
        let cfg = SchedulerConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let back: SchedulerConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: ConsumersConfig = toml::from_str("worker_count = 8\n").unwrap();
        assert_eq!(cfg.worker_count, 8);
        assert_eq!(cfg.batch_size, default_batch_size());
    }
}
