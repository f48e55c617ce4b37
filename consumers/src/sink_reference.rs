//! Reference `Sink`: a SQLite-backed destination, standing in for the
//! OpenSearch cluster `archivist.py::OpenSearchStorage` writes to.
//!
//! Grounded in that class's two load-bearing behaviors: `_create_index`
//! tolerates the index already existing, and `_bulk` reports a per-item
//! outcome so one bad document doesn't fail the rest of the batch. Here
//! `ensure_destination` is a `CREATE TABLE IF NOT EXISTS`, and `store`
//! upserts by `message_id` inside one transaction so replays (the
//! at-least-once contract) never produce duplicate rows.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use core::error::{Error, Result};
use core::model::StreamEntry;
use core::sink::{Sink, StoreOutcome};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

pub struct ReferenceSink {
    connection: Arc<Mutex<Connection>>,
}

impl ReferenceSink {
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .map_err(|e| Error::SinkException(format!("failed to open sink db: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| Error::SinkException(e.to_string()))?;
        Ok(ReferenceSink {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    /// Exposed so tests (and an operator's `--simulate-outage` flag, if one
    /// existed) can force the next `store` call to fail outright, modeling
    /// "Exceptions from sink.store leave the whole batch unacknowledged."
    #[cfg(test)]
    pub async fn poison(&self, destination: &str) {
        let conn = self.connection.lock().await;
        let _ = conn.execute(
            "INSERT OR IGNORE INTO poisoned_destinations (destination) VALUES (?1)",
            params![destination],
        );
    }

    #[cfg(test)]
    pub async fn row_count(&self, destination: &str) -> i64 {
        let conn = self.connection.lock().await;
        conn.query_row(&format!("SELECT COUNT(*) FROM \"{destination}\""), [], |row| {
            row.get(0)
        })
        .unwrap_or(0)
    }
}

#[async_trait]
impl Sink for ReferenceSink {
    async fn ping(&self) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| Error::SinkException(e.to_string()))?;
        Ok(())
    }

    async fn ensure_destination(&self, name: &str) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS poisoned_destinations (destination TEXT PRIMARY KEY);",
        )
        .map_err(|e| Error::SinkException(e.to_string()))?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS \"{name}\" (
                message_id TEXT PRIMARY KEY,
                payload    TEXT NOT NULL
            );"
        );
        conn.execute_batch(&sql)
            .map_err(|e| Error::SinkException(e.to_string()))?;
        Ok(())
    }

    async fn store(&self, destination: &str, entries: &[StreamEntry]) -> Result<Vec<StoreOutcome>> {
        let conn = self.connection.lock().await;

        let poisoned: bool = conn
            .query_row(
                "SELECT 1 FROM poisoned_destinations WHERE destination = ?1",
                params![destination],
                |_| Ok(true),
            )
            .unwrap_or(false);
        if poisoned {
            conn.execute(
                "DELETE FROM poisoned_destinations WHERE destination = ?1",
                params![destination],
            )
            .ok();
            return Err(Error::SinkException(format!(
                "simulated outage writing to {destination}"
            )));
        }

        let sql = format!(
            "INSERT INTO \"{destination}\" (message_id, payload) VALUES (?1, ?2)
             ON CONFLICT(message_id) DO UPDATE SET payload = excluded.payload"
        );

        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            let payload = entry.payload.to_string();
            match conn.execute(&sql, params![entry.message_id, payload]) {
                Ok(_) => outcomes.push(StoreOutcome::Stored {
                    message_id: entry.message_id.clone(),
                }),
                Err(e) => outcomes.push(StoreOutcome::Rejected {
                    message_id: entry.message_id.clone(),
                    reason: e.to_string(),
                }),
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn fresh() -> ReferenceSink {
        let dir = tempfile::tempdir().unwrap();
        ReferenceSink::open(dir.path().join("sink.db")).await.unwrap()
    }

    fn entry(id: &str) -> StreamEntry {
        StreamEntry {
            message_id: id.to_string(),
            payload: json!({"id": id, "data": {"message": "hi"}}),
        }
    }

    #[tokio::test]
    async fn ensure_destination_is_idempotent() {
        let sink = fresh().await;
        sink.ensure_destination("events").await.unwrap();
        sink.ensure_destination("events").await.unwrap();
    }

    #[tokio::test]
    async fn store_is_idempotent_on_message_id() {
        let sink = fresh().await;
        sink.ensure_destination("events").await.unwrap();
        let batch = vec![entry("1"), entry("2")];

        let first = sink.store("events", &batch).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(matches!(first[0], StoreOutcome::Stored { .. }));

        let second = sink.store("events", &batch).await.unwrap();
        assert_eq!(second.len(), 2);

        let conn = sink.connection.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM \"events\"", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn poisoned_destination_fails_the_whole_batch_once() {
        let sink = fresh().await;
        sink.ensure_destination("events").await.unwrap();
        sink.poison("events").await;

        let err = sink.store("events", &[entry("1")]).await.unwrap_err();
        assert!(matches!(err, Error::SinkException(_)));

        // The poison is single-shot; the next call succeeds.
        let ok = sink.store("events", &[entry("1")]).await.unwrap();
        assert_eq!(ok.len(), 1);
    }
}
