//! SQLite-backed `EventStream`, reproducing the Redis Streams semantics
//! `archivist.py` relies on: `_create_consumer_group`'s tolerance of
//! `BUSYGROUP`, `XREADGROUP ... >` for entries never delivered to a group,
//! and `XAUTOCLAIM` for reassigning entries idle past a threshold. There is
//! no blocking read at the SQLite layer, so `read_new` polls on a short
//! interval until `block_ms` elapses, which is observationally equivalent
//! to a blocking read from the caller's point of view.
//!
//! Message ids are `{millis:020}-{seq:010}` so lexicographic and numeric
//! ordering agree, mirroring Redis's own `<ms>-<seq>` id shape.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::StreamEntry;
use crate::stream::EventStream;
use crate::utils::current_timestamp_millis;

pub struct SqliteEventStream {
    connection: Arc<Mutex<Connection>>,
    poll_interval_ms: u64,
}

impl SqliteEventStream {
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .map_err(|e| Error::StreamConnection(format!("failed to open stream db: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS stream_entries (
                stream      TEXT NOT NULL,
                message_id  TEXT NOT NULL,
                payload     TEXT NOT NULL,
                PRIMARY KEY (stream, message_id)
            );

            CREATE TABLE IF NOT EXISTS stream_seq (
                stream      TEXT NOT NULL,
                millis      INTEGER NOT NULL,
                seq         INTEGER NOT NULL,
                PRIMARY KEY (stream, millis)
            );

            CREATE TABLE IF NOT EXISTS consumer_groups (
                stream            TEXT NOT NULL,
                grp               TEXT NOT NULL,
                last_delivered_id TEXT NOT NULL,
                PRIMARY KEY (stream, grp)
            );

            CREATE TABLE IF NOT EXISTS pending_entries (
                stream      TEXT NOT NULL,
                grp         TEXT NOT NULL,
                message_id  TEXT NOT NULL,
                consumer    TEXT NOT NULL,
                claimed_at  INTEGER NOT NULL,
                PRIMARY KEY (stream, grp, message_id)
            );
            "#,
        )
        .map_err(|e| Error::StreamConnection(e.to_string()))?;

        Ok(SqliteEventStream {
            connection: Arc::new(Mutex::new(conn)),
            poll_interval_ms: 100,
        })
    }

    /// Overrides the internal poll granularity `read_new` uses while waiting
    /// for `block_ms` to elapse. Tests use this to avoid slow real-time
    /// polling loops.
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    fn next_message_id(conn: &Connection, stream: &str) -> rusqlite::Result<String> {
        let millis = current_timestamp_millis() as i64;
        let seq: i64 = conn.query_row(
            "INSERT INTO stream_seq (stream, millis, seq) VALUES (?1, ?2, 0)
             ON CONFLICT(stream, millis) DO UPDATE SET seq = seq + 1
             RETURNING seq",
            params![stream, millis],
            |row| row.get(0),
        )?;
        Ok(format!("{millis:020}-{seq:010}"))
    }
}

#[async_trait]
impl EventStream for SqliteEventStream {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO consumer_groups (stream, grp, last_delivered_id)
             VALUES (?1, ?2, '00000000000000000000-0000000000')
             ON CONFLICT(stream, grp) DO NOTHING",
            params![stream, group],
        )
        .map_err(|e| Error::StreamConnection(e.to_string()))?;
        Ok(())
    }

    async fn append(&self, stream: &str, payload: Value) -> Result<String> {
        let conn = self.connection.lock().await;
        let message_id = Self::next_message_id(&conn, stream)
            .map_err(|e| Error::StreamConnection(e.to_string()))?;
        conn.execute(
            "INSERT INTO stream_entries (stream, message_id, payload) VALUES (?1, ?2, ?3)",
            params![stream, message_id, payload.to_string()],
        )
        .map_err(|e| Error::StreamConnection(e.to_string()))?;
        Ok(message_id)
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(block_ms);
        loop {
            let entries = {
                let mut conn = self.connection.lock().await;
                let tx = conn
                    .transaction()
                    .map_err(|e| Error::StreamConnection(e.to_string()))?;

                let last_delivered: String = tx
                    .query_row(
                        "SELECT last_delivered_id FROM consumer_groups WHERE stream = ?1 AND grp = ?2",
                        params![stream, group],
                        |row| row.get(0),
                    )
                    .map_err(|e| Error::StreamConnection(e.to_string()))?;

                let mut stmt = tx
                    .prepare(
                        "SELECT message_id, payload FROM stream_entries
                         WHERE stream = ?1 AND message_id > ?2
                         ORDER BY message_id ASC LIMIT ?3",
                    )
                    .map_err(|e| Error::StreamConnection(e.to_string()))?;
                let rows: Vec<(String, String)> = stmt
                    .query_map(params![stream, last_delivered, count as i64], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .map_err(|e| Error::StreamConnection(e.to_string()))?
                    .collect::<rusqlite::Result<_>>()
                    .map_err(|e| Error::StreamConnection(e.to_string()))?;
                drop(stmt);

                if !rows.is_empty() {
                    let now = current_timestamp_millis() as i64;
                    let max_id = rows.last().unwrap().0.clone();
                    for (message_id, _) in &rows {
                        tx.execute(
                            "INSERT INTO pending_entries (stream, grp, message_id, consumer, claimed_at)
                             VALUES (?1, ?2, ?3, ?4, ?5)
                             ON CONFLICT(stream, grp, message_id) DO UPDATE SET
                                consumer = excluded.consumer, claimed_at = excluded.claimed_at",
                            params![stream, group, message_id, consumer, now],
                        )
                        .map_err(|e| Error::StreamConnection(e.to_string()))?;
                    }
                    tx.execute(
                        "UPDATE consumer_groups SET last_delivered_id = ?3
                         WHERE stream = ?1 AND grp = ?2",
                        params![stream, group, max_id],
                    )
                    .map_err(|e| Error::StreamConnection(e.to_string()))?;
                }

                tx.commit().map_err(|e| Error::StreamConnection(e.to_string()))?;

                rows.into_iter()
                    .map(|(message_id, payload)| StreamEntry {
                        message_id,
                        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                    })
                    .collect::<Vec<_>>()
            };

            if !entries.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(entries);
            }
            tokio::time::sleep(Duration::from_millis(self.poll_interval_ms.min(block_ms.max(1))))
                .await;
        }
    }

    async fn recover_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.connection.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| Error::StreamConnection(e.to_string()))?;

        let now = current_timestamp_millis() as i64;
        let threshold = now - min_idle_ms as i64;

        let candidates: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    "SELECT message_id FROM pending_entries
                     WHERE stream = ?1 AND grp = ?2 AND claimed_at <= ?3
                     ORDER BY claimed_at ASC LIMIT ?4",
                )
                .map_err(|e| Error::StreamConnection(e.to_string()))?;
            stmt.query_map(params![stream, group, threshold, count as i64], |row| {
                row.get(0)
            })
            .map_err(|e| Error::StreamConnection(e.to_string()))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| Error::StreamConnection(e.to_string()))?
        };

        let mut out = Vec::with_capacity(candidates.len());
        for message_id in &candidates {
            tx.execute(
                "UPDATE pending_entries SET consumer = ?4, claimed_at = ?5
                 WHERE stream = ?1 AND grp = ?2 AND message_id = ?3",
                params![stream, group, message_id, consumer, now],
            )
            .map_err(|e| Error::StreamConnection(e.to_string()))?;

            let payload: Option<String> = tx
                .query_row(
                    "SELECT payload FROM stream_entries WHERE stream = ?1 AND message_id = ?2",
                    params![stream, message_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| Error::StreamConnection(e.to_string()))?;

            match payload {
                Some(payload) => out.push(StreamEntry {
                    message_id: message_id.clone(),
                    payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                }),
                None => {
                    // The entry no longer exists in the stream (e.g. trimmed
                    // by retention). Drop it from the pending set so it
                    // doesn't keep surfacing on every recovery sweep.
                    tx.execute(
                        "DELETE FROM pending_entries WHERE stream = ?1 AND grp = ?2 AND message_id = ?3",
                        params![stream, group, message_id],
                    )
                    .map_err(|e| Error::StreamConnection(e.to_string()))?;
                }
            }
        }

        tx.commit().map_err(|e| Error::StreamConnection(e.to_string()))?;
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "DELETE FROM pending_entries WHERE stream = ?1 AND grp = ?2 AND message_id = ?3",
            params![stream, group, message_id],
        )
        .map_err(|e| Error::StreamConnection(e.to_string()))?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| Error::StreamConnection(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh() -> SqliteEventStream {
        let dir = tempfile::tempdir().unwrap();
        SqliteEventStream::open(dir.path().join("stream.db"))
            .await
            .unwrap()
            .with_poll_interval_ms(5)
    }

    #[tokio::test]
    async fn ensure_group_is_idempotent() {
        let s = fresh().await;
        s.ensure_group("events", "archivists").await.unwrap();
        s.ensure_group("events", "archivists").await.unwrap();
    }

    #[tokio::test]
    async fn read_new_never_redelivers_to_the_same_group() {
        let s = fresh().await;
        s.ensure_group("events", "g").await.unwrap();
        for i in 0..3 {
            s.append("events", serde_json::json!({"n": i})).await.unwrap();
        }
        let first = s.read_new("events", "g", "c1", 10, 50).await.unwrap();
        assert_eq!(first.len(), 3);
        let second = s.read_new("events", "g", "c1", 10, 50).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn recover_pending_reassigns_idle_entries() {
        let s = fresh().await;
        s.ensure_group("events", "g").await.unwrap();
        s.append("events", serde_json::json!({"n": 1})).await.unwrap();
        let read = s.read_new("events", "g", "c1", 10, 50).await.unwrap();
        assert_eq!(read.len(), 1);

        // Not idle yet: a huge min_idle_ms excludes it.
        let none = s.recover_pending("events", "g", "c2", 60_000, 10).await.unwrap();
        assert!(none.is_empty());

        // Idle for at least 0ms: eligible immediately.
        let claimed = s.recover_pending("events", "g", "c2", 0, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].message_id, read[0].message_id);
    }

    #[tokio::test]
    async fn ack_removes_from_pending_and_recovery_stops_seeing_it() {
        let s = fresh().await;
        s.ensure_group("events", "g").await.unwrap();
        s.append("events", serde_json::json!({"n": 1})).await.unwrap();
        let read = s.read_new("events", "g", "c1", 10, 50).await.unwrap();
        s.ack("events", "g", &read[0].message_id).await.unwrap();

        let claimed = s.recover_pending("events", "g", "c2", 0, 10).await.unwrap();
        assert!(claimed.is_empty());
    }
}
