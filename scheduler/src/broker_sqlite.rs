//! In-process Work Broker, backed by a SQLite delayed-job queue.
//!
//! A `status` column plus a `next_retry_at`-style readiness column, with
//! an index on `(state, run_time)` so the ticker's "what's due" query
//! stays a simple index scan. There is no external rq/Redis worker here:
//! `spawn_ticker` polls for work on an interval and hands it off to a
//! `JobRunner`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core::broker::{BrokerJobRecord, BrokerJobState, EnqueueSpec, JobRunner, WorkBroker};
use core::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct SqliteBroker {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteBroker {
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .map_err(|e| Error::Broker(format!("failed to open broker database: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS broker_jobs (
                job_id    TEXT PRIMARY KEY,
                task_id   TEXT NOT NULL,
                queue     TEXT NOT NULL,
                run_time  TEXT NOT NULL,
                state     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_broker_jobs_due ON broker_jobs(state, run_time);
            "#,
        )?;
        Ok(SqliteBroker {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    /// Spawn the background ticker that polls for due jobs and hands each
    /// one to `runner`. Returns a handle the caller can abort on shutdown.
    pub fn spawn_ticker(
        self: &Arc<Self>,
        runner: Arc<dyn JobRunner>,
        poll_interval: Duration,
    ) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                match broker.take_due_jobs().await {
                    Ok(due) => {
                        for job_id in due {
                            let runner = Arc::clone(&runner);
                            tokio::spawn(async move {
                                runner.run_job(job_id).await;
                            });
                        }
                    }
                    Err(e) => warn!("failed to poll broker for due jobs: {e}"),
                }
            }
        })
    }

    async fn take_due_jobs(&self) -> Result<Vec<Uuid>> {
        let conn = self.connection.lock().await;
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT job_id FROM broker_jobs WHERE state = 'scheduled' AND run_time <= ?1",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![now], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        let mut due = Vec::new();
        for id in ids {
            conn.execute(
                "UPDATE broker_jobs SET state = 'running' WHERE job_id = ?1 AND state = 'scheduled'",
                params![id],
            )?;
            if let Ok(uuid) = id.parse() {
                due.push(uuid);
            }
        }
        if !due.is_empty() {
            debug!(count = due.len(), "broker found due jobs");
        }
        Ok(due)
    }
}

#[async_trait]
impl WorkBroker for SqliteBroker {
    async fn enqueue_at(&self, spec: EnqueueSpec) -> Result<()> {
        let conn = self.connection.lock().await;
        // Plain INSERT, no upsert: re-scheduling the same `job_id` must
        // surface as an error per the adapter's idempotency contract, not
        // silently replace the existing entry.
        conn.execute(
            "INSERT INTO broker_jobs (job_id, task_id, queue, run_time, state)
             VALUES (?1, ?2, ?3, ?4, 'scheduled')",
            params![
                spec.job_id.to_string(),
                spec.task_id.to_string(),
                spec.queue,
                spec.run_time.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Broker(format!("job {} already enqueued: {e}", spec.job_id)))?;
        Ok(())
    }

    async fn fetch(&self, job_id: Uuid) -> Result<Option<BrokerJobRecord>> {
        let conn = self.connection.lock().await;
        let row = conn
            .query_row(
                "SELECT job_id, queue, run_time, state FROM broker_jobs WHERE job_id = ?1",
                params![job_id.to_string()],
                |row| {
                    let job_id: String = row.get(0)?;
                    let queue: String = row.get(1)?;
                    let run_time: String = row.get(2)?;
                    let state: String = row.get(3)?;
                    Ok((job_id, queue, run_time, state))
                },
            )
            .optional()
            .map_err(|e| Error::Broker(e.to_string()))?;

        let Some((job_id, queue, run_time, state)) = row else {
            return Ok(None);
        };

        let run_time: DateTime<Utc> = DateTime::parse_from_rfc3339(&run_time)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| Error::Broker(format!("bad run_time: {e}")))?;
        let state = match state.as_str() {
            "scheduled" => BrokerJobState::Scheduled,
            "running" => BrokerJobState::Running,
            "queued" => BrokerJobState::Queued,
            _ => BrokerJobState::Finished,
        };

        Ok(Some(BrokerJobRecord {
            job_id: job_id.parse().map_err(|_| Error::Broker("bad job id".into()))?,
            queue,
            run_time,
            state,
        }))
    }

    async fn cancel(&self, job_id: Uuid) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "DELETE FROM broker_jobs WHERE job_id = ?1 AND state = 'scheduled'",
            params![job_id.to_string()],
        )
        .map_err(|e| Error::Broker(e.to_string()))?;
        Ok(())
    }

    async fn mark_finished(&self, job_id: Uuid) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "UPDATE broker_jobs SET state = 'finished' WHERE job_id = ?1",
            params![job_id.to_string()],
        )
        .map_err(|e| Error::Broker(e.to_string()))?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| Error::Broker(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(job_id: Uuid) -> EnqueueSpec {
        EnqueueSpec {
            job_id,
            task_id: Uuid::new_v4(),
            queue: "default".to_string(),
            run_time: Utc::now(),
            result_ttl_secs: 86_400,
            job_timeout_secs: 600,
        }
    }

    #[tokio::test]
    async fn enqueue_at_rejects_a_repeat_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let broker = SqliteBroker::open(dir.path().join("b.db")).await.unwrap();
        let job_id = Uuid::new_v4();

        broker.enqueue_at(spec(job_id)).await.unwrap();
        let err = broker.enqueue_at(spec(job_id)).await.unwrap_err();
        assert!(matches!(err, Error::Broker(_)));
    }
}
