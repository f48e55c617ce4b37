//! Event stream abstraction, standing in for Redis Streams consumer groups.
//!
//! Grounded in `archivist.py`'s `_create_consumer_group` /
//! `_recover_stream_entries` / `events_consumer` trio: a stream is an
//! append-only log, a consumer group tracks per-group read position and a
//! pending-entries list, `read_new` is XREADGROUP's ">" form, and
//! `recover_pending` is XAUTOCLAIM for entries some consumer claimed but
//! never acknowledged.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::StreamEntry;

#[async_trait]
pub trait EventStream: Send + Sync {
    /// Create the consumer group if it does not already exist. Tolerant of
    /// the group already being present (the BUSYGROUP case).
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Append an entry to the stream. Returns the assigned message id.
    async fn append(&self, stream: &str, payload: serde_json::Value) -> Result<String>;

    /// Read up to `count` entries the group has not yet delivered to any
    /// consumer, blocking for up to `block_ms` if none are available.
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>>;

    /// Claim up to `count` entries that have been pending for at least
    /// `min_idle_ms` without being acknowledged, reassigning them to
    /// `consumer`.
    async fn recover_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge an entry, removing it from the group's pending list.
    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}
