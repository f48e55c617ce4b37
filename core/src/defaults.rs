//! Default values for configuration parameters.
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain optional
//! fields.

/// Default interval between runs of a recurring task, in seconds (0 = run once).
pub fn default_job_interval() -> i64 {
    0
}

/// Default number of retries a task gets after a failed job (3 attempts).
pub fn default_job_max_retries() -> u32 {
    3
}

/// Default burst flag for newly created tasks (false: respect job_interval).
pub fn default_burst() -> bool {
    false
}

/// Default queue a task's jobs land on absent a type-specific override.
pub fn default_queue() -> String {
    "default".to_string()
}

/// Default TTL for a finished job's result, in seconds (1 day).
pub fn default_job_result_ttl_seconds() -> i64 {
    86400
}

/// Default wall-clock budget for a single job attempt, in seconds (10 minutes).
pub fn default_job_timeout_seconds() -> i64 {
    600
}

/// Default interval between `maintain_tasks` sweeps, in seconds (1 minute).
pub fn default_maintenance_interval_seconds() -> u64 {
    60
}

/// Default path to the scheduler's SQLite database file.
pub fn default_scheduler_database_path() -> String {
    "scheduler.db".to_string()
}

/// Default path to the SQLite file backing the shared event stream. The
/// scheduler's job functions append to this file; the consumer pool reads
/// from it. Both binaries must point at the same path to actually share a
/// stream.
pub fn default_events_database_path() -> String {
    "events.db".to_string()
}

/// Default recovery grace period: how long a RECOVERY task waits before
/// being retried, in seconds (5 minutes).
pub fn default_recovery_delay_seconds() -> i64 {
    300
}

/// Default name of the event stream the consumer pool reads from.
pub fn default_stream_name() -> String {
    "grimoire:events".to_string()
}

/// Default consumer group name.
pub fn default_consumer_group() -> String {
    "archivists".to_string()
}

/// Default number of workers in the consumer pool.
pub fn default_worker_count() -> usize {
    4
}

/// Default number of entries requested per read, new or recovered (10).
pub fn default_batch_size() -> usize {
    10
}

/// Default time a read blocks waiting for new entries, in milliseconds (5s).
pub fn default_block_timeout_ms() -> u64 {
    5000
}

/// Default idle time before a pending entry becomes eligible for recovery
/// by another consumer, in milliseconds (5 minutes).
pub fn default_recover_idle_ms() -> u64 {
    5 * 60 * 1000
}

/// Default base delay for exponential backoff after a transient stream or
/// sink error, in milliseconds (500ms).
pub fn default_backoff_base_ms() -> u64 {
    500
}

/// Default cap on exponential backoff delay, in milliseconds (30 seconds).
pub fn default_backoff_cap_ms() -> u64 {
    30_000
}

/// Default path to the reference sink's SQLite-backed destination file.
pub fn default_sink_database_path() -> String {
    "sink.db".to_string()
}

/// Default graceful shutdown timeout: how long to let in-flight batches
/// finish after a SIGTERM/SIGINT before the pool gives up waiting (30s).
pub fn default_graceful_shutdown_timeout_seconds() -> u64 {
    30
}
