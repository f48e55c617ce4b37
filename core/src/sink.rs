//! Sink abstraction: where consumed stream entries ultimately land.
//!
//! Grounded in `archivist.py`'s `OpenSearchStorage`: `_create_index` is
//! tolerant of the index already existing, `_bulk` reports a per-item
//! outcome rather than failing the whole batch on one bad document, and
//! `store` chunks its input at a fixed batch size before handing it to
//! `_bulk`. The chunking here is left to the caller (the consumer pool
//! already reads in bounded batches), so `store` takes whatever slice it is
//! given and reports one outcome per entry, preserving input order.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::StreamEntry;

#[derive(Debug, Clone)]
pub enum StoreOutcome {
    Stored { message_id: String },
    Rejected { message_id: String, reason: String },
}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Idempotent: safe to call before every batch, or once at startup.
    async fn ensure_destination(&self, name: &str) -> Result<()>;

    /// Store a batch of entries. A per-entry rejection yields
    /// `StoreOutcome::Rejected` for that entry without failing the rest of
    /// the batch; an `Err` means the whole batch could not be attempted
    /// (connection lost, destination unreachable) and none of it should be
    /// acknowledged.
    async fn store(&self, destination: &str, entries: &[StreamEntry]) -> Result<Vec<StoreOutcome>>;
}
