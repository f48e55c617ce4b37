//! Task Store: durable state for Tasks and Jobs.
//!
//! One `tasks` table and one `jobs` table back every task type; a type's
//! own parameters live in the `args`/`params` JSON columns rather than in a
//! dedicated table (see the note on `Task` in `model.rs`). The connection
//! is lazy: a `PathBuf` plus an `Option<Connection>` opened on first use,
//! with WAL mode enabled for concurrent readers alongside the writer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Job, JobStatus, LogRecord, Task, TaskStatus};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &Task) -> Result<()>;
    async fn save_task(&self, task: &Task) -> Result<()>;
    async fn find_task(&self, id: Uuid) -> Result<Task>;
    async fn find_tasks_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>>;

    async fn insert_job(&self, job: &Job) -> Result<()>;
    async fn find_job(&self, id: Uuid) -> Result<Job>;
    async fn find_jobs_for_task(&self, task_id: Uuid) -> Result<Vec<Job>>;
    async fn find_last_job_for_task(&self, task_id: Uuid) -> Result<Option<Job>>;
    /// Jobs for a task that have not yet reached a terminal status.
    async fn find_live_jobs_for_task(&self, task_id: Uuid) -> Result<Vec<Job>>;

    /// Atomically move a Job to a terminal status (carrying progress/logs)
    /// and the owning Task to the status that follows from it, returning
    /// the Task as it stood after the update.
    async fn save_run(
        &self,
        job_id: Uuid,
        job_status: JobStatus,
        progress: Option<serde_json::Value>,
        logs: Vec<LogRecord>,
        task_update: TaskUpdate,
    ) -> Result<Task>;

    async fn mark_job_canceled(&self, job_id: Uuid) -> Result<()>;
    async fn mark_job_running(&self, job_id: Uuid) -> Result<()>;
    async fn set_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

/// What `save_run` should do to the owning Task alongside finishing the Job.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub bump_runs: bool,
    pub bump_failures: bool,
    pub reset_failures: bool,
}

pub struct SqliteTaskStore {
    db_path: PathBuf,
    connection: Arc<Mutex<Option<Connection>>>,
}

impl SqliteTaskStore {
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let store = SqliteTaskStore {
            db_path: db_path.as_ref().to_path_buf(),
            connection: Arc::new(Mutex::new(None)),
        };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        self.ensure_connection(&mut *guard)?;
        let conn = guard.as_ref().unwrap();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id              TEXT PRIMARY KEY,
                task_type       TEXT NOT NULL,
                args            TEXT NOT NULL,
                queue           TEXT NOT NULL,
                status          TEXT NOT NULL,
                job_interval    INTEGER NOT NULL,
                job_max_retries INTEGER NOT NULL,
                burst           INTEGER NOT NULL,
                runs            INTEGER NOT NULL DEFAULT 0,
                failures        INTEGER NOT NULL DEFAULT 0,
                last_run        TEXT,
                scheduled_at    TEXT,
                created_at      TEXT NOT NULL,
                last_modified   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

            CREATE TABLE IF NOT EXISTS jobs (
                id              TEXT PRIMARY KEY,
                task_id         TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                job_num         INTEGER NOT NULL,
                queue           TEXT NOT NULL,
                params          TEXT NOT NULL,
                status          TEXT NOT NULL,
                progress        TEXT,
                logs            TEXT NOT NULL DEFAULT '[]',
                scheduled_at    TEXT NOT NULL,
                started_at      TEXT,
                finished_at     TEXT,
                created_at      TEXT NOT NULL,
                last_modified   TEXT NOT NULL,
                UNIQUE(task_id, job_num)
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_task_id ON jobs(task_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            "#,
        )?;

        Ok(())
    }

    /// Opens the connection on first use and enables WAL mode, mirroring
    /// the lazy-init pattern used for the rest of the system's databases.
    fn ensure_connection(&self, guard: &mut Option<Connection>) -> Result<()> {
        if guard.is_none() {
            let conn = Connection::open(&self.db_path).map_err(|e| {
                Error::Storage(format!("failed to open {}: {e}", self.db_path.display()))
            })?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            *guard = Some(conn);
        }
        Ok(())
    }
}

fn dt_to_text(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn dt_from_text(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("bad timestamp {s:?}: {e}")))
}

fn opt_dt_to_text(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(dt_to_text)
}

fn opt_dt_from_text(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| dt_from_text(&s)).transpose()
}

/// Raw columns pulled out of a `tasks` row. Kept separate from `Task` so the
/// fallible parts of the conversion (JSON, enum, timestamps) happen outside
/// of rusqlite's row-mapping closures, which can only fail with
/// `rusqlite::Error`.
struct TaskRow {
    id: String,
    task_type: String,
    args: String,
    queue: String,
    status: String,
    job_interval: i64,
    job_max_retries: u32,
    burst: i64,
    runs: u32,
    failures: u32,
    last_run: Option<String>,
    scheduled_at: Option<String>,
    created_at: String,
    last_modified: String,
}

const TASK_COLUMNS: &str = "id, task_type, args, queue, status, job_interval, job_max_retries, \
    burst, runs, failures, last_run, scheduled_at, created_at, last_modified";

fn task_row(row: &Row) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        task_type: row.get(1)?,
        args: row.get(2)?,
        queue: row.get(3)?,
        status: row.get(4)?,
        job_interval: row.get(5)?,
        job_max_retries: row.get(6)?,
        burst: row.get(7)?,
        runs: row.get(8)?,
        failures: row.get(9)?,
        last_run: row.get(10)?,
        scheduled_at: row.get(11)?,
        created_at: row.get(12)?,
        last_modified: row.get(13)?,
    })
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: self
                .id
                .parse()
                .map_err(|_| Error::Storage("bad task id".into()))?,
            task_type: self.task_type,
            args: serde_json::from_str(&self.args).unwrap_or(serde_json::Value::Null),
            queue: self.queue,
            status: TaskStatus::from_str(&self.status)
                .ok_or_else(|| Error::Storage(format!("bad task status {:?}", self.status)))?,
            job_interval: self.job_interval,
            job_max_retries: self.job_max_retries,
            burst: self.burst != 0,
            runs: self.runs,
            failures: self.failures,
            last_run: opt_dt_from_text(self.last_run)?,
            scheduled_at: opt_dt_from_text(self.scheduled_at)?,
            created_at: dt_from_text(&self.created_at)?,
            last_modified: dt_from_text(&self.last_modified)?,
        })
    }
}

struct JobRow {
    id: String,
    task_id: String,
    job_num: u32,
    queue: String,
    params: String,
    status: String,
    progress: Option<String>,
    logs: String,
    scheduled_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    created_at: String,
    last_modified: String,
}

const JOB_COLUMNS: &str = "id, task_id, job_num, queue, params, status, progress, logs, \
    scheduled_at, started_at, finished_at, created_at, last_modified";

fn job_row(row: &Row) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        job_num: row.get(2)?,
        queue: row.get(3)?,
        params: row.get(4)?,
        status: row.get(5)?,
        progress: row.get(6)?,
        logs: row.get(7)?,
        scheduled_at: row.get(8)?,
        started_at: row.get(9)?,
        finished_at: row.get(10)?,
        created_at: row.get(11)?,
        last_modified: row.get(12)?,
    })
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self
                .id
                .parse()
                .map_err(|_| Error::Storage("bad job id".into()))?,
            task_id: self
                .task_id
                .parse()
                .map_err(|_| Error::Storage("bad task id".into()))?,
            job_num: self.job_num,
            queue: self.queue,
            params: serde_json::from_str(&self.params).unwrap_or(serde_json::Value::Null),
            status: JobStatus::from_str(&self.status)
                .ok_or_else(|| Error::Storage(format!("bad job status {:?}", self.status)))?,
            progress: self.progress.and_then(|p| serde_json::from_str(&p).ok()),
            logs: serde_json::from_str(&self.logs).unwrap_or_default(),
            scheduled_at: dt_from_text(&self.scheduled_at)?,
            started_at: opt_dt_from_text(self.started_at)?,
            finished_at: opt_dt_from_text(self.finished_at)?,
            created_at: dt_from_text(&self.created_at)?,
            last_modified: dt_from_text(&self.last_modified)?,
        })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        let mut guard = self.connection.lock().await;
        self.ensure_connection(&mut *guard)?;
        let conn = guard.as_ref().unwrap();
        conn.execute(
            "INSERT INTO tasks (id, task_type, args, queue, status, job_interval, job_max_retries,
                burst, runs, failures, last_run, scheduled_at, created_at, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                task.id.to_string(),
                task.task_type,
                serde_json::to_string(&task.args).unwrap_or_default(),
                task.queue,
                task.status.as_str(),
                task.job_interval,
                task.job_max_retries,
                task.burst as i64,
                task.runs,
                task.failures,
                opt_dt_to_text(task.last_run),
                opt_dt_to_text(task.scheduled_at),
                dt_to_text(task.created_at),
                dt_to_text(task.last_modified),
            ],
        )?;
        Ok(())
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut guard = self.connection.lock().await;
        self.ensure_connection(&mut *guard)?;
        let conn = guard.as_ref().unwrap();
        conn.execute(
            "UPDATE tasks SET task_type=?2, args=?3, queue=?4, status=?5, job_interval=?6,
                job_max_retries=?7, burst=?8, runs=?9, failures=?10, last_run=?11,
                scheduled_at=?12, last_modified=?13
             WHERE id=?1",
            params![
                task.id.to_string(),
                task.task_type,
                serde_json::to_string(&task.args).unwrap_or_default(),
                task.queue,
                task.status.as_str(),
                task.job_interval,
                task.job_max_retries,
                task.burst as i64,
                task.runs,
                task.failures,
                opt_dt_to_text(task.last_run),
                opt_dt_to_text(task.scheduled_at),
                dt_to_text(Utc::now()),
            ],
        )?;
        Ok(())
    }

    async fn find_task(&self, id: Uuid) -> Result<Task> {
        let mut guard = self.connection.lock().await;
        self.ensure_connection(&mut *guard)?;
        let conn = guard.as_ref().unwrap();
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let row = conn
            .query_row(&sql, params![id.to_string()], task_row)
            .optional()?;
        match row {
            Some(r) => r.into_task(),
            None => Err(Error::NotFound {
                kind: "task",
                id: id.to_string(),
            }),
        }
    }

    async fn find_tasks_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let mut guard = self.connection.lock().await;
        self.ensure_connection(&mut *guard)?;
        let conn = guard.as_ref().unwrap();
        let placeholders = statuses.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let tags: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = stmt.query_map(rusqlite::params_from_iter(tags), task_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_task()?);
        }
        Ok(out)
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        let mut guard = self.connection.lock().await;
        self.ensure_connection(&mut *guard)?;
        let conn = guard.as_ref().unwrap();
        conn.execute(
            "INSERT INTO jobs (id, task_id, job_num, queue, params, status, progress, logs,
                scheduled_at, started_at, finished_at, created_at, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                job.id.to_string(),
                job.task_id.to_string(),
                job.job_num,
                job.queue,
                serde_json::to_string(&job.params).unwrap_or_default(),
                job.status.as_str(),
                job.progress
                    .as_ref()
                    .map(|p| serde_json::to_string(p).unwrap_or_default()),
                serde_json::to_string(&job.logs).unwrap_or_default(),
                dt_to_text(job.scheduled_at),
                opt_dt_to_text(job.started_at),
                opt_dt_to_text(job.finished_at),
                dt_to_text(job.created_at),
                dt_to_text(job.last_modified),
            ],
        )?;
        Ok(())
    }

    async fn find_job(&self, id: Uuid) -> Result<Job> {
        let mut guard = self.connection.lock().await;
        self.ensure_connection(&mut *guard)?;
        let conn = guard.as_ref().unwrap();
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row = conn
            .query_row(&sql, params![id.to_string()], job_row)
            .optional()?;
        match row {
            Some(r) => r.into_job(),
            None => Err(Error::NotFound {
                kind: "job",
                id: id.to_string(),
            }),
        }
    }

    async fn find_jobs_for_task(&self, task_id: Uuid) -> Result<Vec<Job>> {
        let mut guard = self.connection.lock().await;
        self.ensure_connection(&mut *guard)?;
        let conn = guard.as_ref().unwrap();
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE task_id = ?1 ORDER BY job_num ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![task_id.to_string()], job_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_job()?);
        }
        Ok(out)
    }

    async fn find_last_job_for_task(&self, task_id: Uuid) -> Result<Option<Job>> {
        let mut guard = self.connection.lock().await;
        self.ensure_connection(&mut *guard)?;
        let conn = guard.as_ref().unwrap();
        let sql =
            format!("SELECT {JOB_COLUMNS} FROM jobs WHERE task_id = ?1 ORDER BY job_num DESC LIMIT 1");
        let row = conn
            .query_row(&sql, params![task_id.to_string()], job_row)
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    async fn find_live_jobs_for_task(&self, task_id: Uuid) -> Result<Vec<Job>> {
        let mut guard = self.connection.lock().await;
        self.ensure_connection(&mut *guard)?;
        let conn = guard.as_ref().unwrap();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE task_id = ?1 AND status IN ('enqueued','running')
             ORDER BY job_num ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![task_id.to_string()], job_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_job()?);
        }
        Ok(out)
    }

    async fn save_run(
        &self,
        job_id: Uuid,
        job_status: JobStatus,
        progress: Option<serde_json::Value>,
        logs: Vec<LogRecord>,
        task_update: TaskUpdate,
    ) -> Result<Task> {
        let mut guard = self.connection.lock().await;
        self.ensure_connection(&mut *guard)?;
        let conn = guard.as_mut().unwrap();
        let now = dt_to_text(Utc::now());
        let tx = conn.transaction()?;

        let task_id: String = tx.query_row(
            "SELECT task_id FROM jobs WHERE id = ?1",
            params![job_id.to_string()],
            |row| row.get(0),
        )?;

        tx.execute(
            "UPDATE jobs SET status=?2, progress=?3, logs=?4, finished_at=?5, last_modified=?5
             WHERE id=?1",
            params![
                job_id.to_string(),
                job_status.as_str(),
                progress
                    .as_ref()
                    .map(|p| serde_json::to_string(p).unwrap_or_default()),
                serde_json::to_string(&logs).unwrap_or_default(),
                now,
            ],
        )?;

        tx.execute(
            "UPDATE tasks SET
                status=?2,
                scheduled_at=?3,
                runs = runs + ?4,
                failures = CASE WHEN ?6 THEN 0 ELSE failures + ?5 END,
                last_run=?7,
                last_modified=?7
             WHERE id=?1",
            params![
                task_id,
                task_update.status.as_str(),
                opt_dt_to_text(task_update.scheduled_at),
                task_update.bump_runs as i64,
                task_update.bump_failures as i64,
                task_update.reset_failures,
                now,
            ],
        )?;

        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let row = tx.query_row(&sql, params![task_id], task_row)?;
        tx.commit()?;
        row.into_task()
    }

    async fn mark_job_canceled(&self, job_id: Uuid) -> Result<()> {
        let mut guard = self.connection.lock().await;
        self.ensure_connection(&mut *guard)?;
        let conn = guard.as_ref().unwrap();
        conn.execute(
            "UPDATE jobs SET status='canceled', finished_at=?2, last_modified=?2
             WHERE id=?1 AND status IN ('enqueued','running')",
            params![job_id.to_string(), dt_to_text(Utc::now())],
        )?;
        Ok(())
    }

    async fn mark_job_running(&self, job_id: Uuid) -> Result<()> {
        let mut guard = self.connection.lock().await;
        self.ensure_connection(&mut *guard)?;
        let conn = guard.as_ref().unwrap();
        conn.execute(
            "UPDATE jobs SET status='running', started_at=?2, last_modified=?2
             WHERE id=?1 AND status='enqueued'",
            params![job_id.to_string(), dt_to_text(Utc::now())],
        )?;
        Ok(())
    }

    async fn set_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut guard = self.connection.lock().await;
        self.ensure_connection(&mut *guard)?;
        let conn = guard.as_ref().unwrap();
        conn.execute(
            "UPDATE tasks SET status=?2, scheduled_at=?3, last_modified=?4 WHERE id=?1",
            params![
                task_id.to_string(),
                status.as_str(),
                opt_dt_to_text(scheduled_at),
                dt_to_text(Utc::now()),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskStatus;

    async fn fresh_store() -> SqliteTaskStore {
        let dir = tempfile::tempdir().unwrap();
        SqliteTaskStore::open(dir.path().join("store.db"))
            .await
            .unwrap()
    }

    fn sample_task() -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            task_type: "noop".to_string(),
            args: serde_json::json!({}),
            queue: "default".to_string(),
            status: TaskStatus::New,
            job_interval: 0,
            job_max_retries: 3,
            burst: false,
            runs: 0,
            failures: 0,
            last_run: None,
            scheduled_at: None,
            created_at: now,
            last_modified: now,
        }
    }

    #[tokio::test]
    async fn insert_and_find_round_trips() {
        let store = fresh_store().await;
        let task = sample_task();
        store.insert_task(&task).await.unwrap();
        let found = store.find_task(task.id).await.unwrap();
        assert_eq!(found.task_type, "noop");
        assert_eq!(found.status, TaskStatus::New);
    }

    #[tokio::test]
    async fn find_missing_task_is_not_found() {
        let store = fresh_store().await;
        let err = store.find_task(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "task", .. }));
    }

    #[tokio::test]
    async fn save_run_updates_job_and_task_atomically() {
        let store = fresh_store().await;
        let task = sample_task();
        store.insert_task(&task).await.unwrap();

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            task_id: task.id,
            job_num: 1,
            queue: "default".to_string(),
            params: serde_json::json!({}),
            status: JobStatus::Running,
            progress: None,
            logs: vec![],
            scheduled_at: now,
            started_at: Some(now),
            finished_at: None,
            created_at: now,
            last_modified: now,
        };
        store.insert_job(&job).await.unwrap();

        let updated = store
            .save_run(
                job.id,
                JobStatus::Completed,
                Some(serde_json::json!({"n": 3})),
                vec![LogRecord::new("info", "done")],
                TaskUpdate {
                    status: TaskStatus::Completed,
                    scheduled_at: None,
                    bump_runs: true,
                    bump_failures: false,
                    reset_failures: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, TaskStatus::Completed);
        assert_eq!(updated.runs, 1);
        assert_eq!(updated.failures, 0);

        let saved_job = store.find_job(job.id).await.unwrap();
        assert_eq!(saved_job.status, JobStatus::Completed);
        assert_eq!(saved_job.progress, Some(serde_json::json!({"n": 3})));
    }

    #[tokio::test]
    async fn find_live_jobs_excludes_terminal_ones() {
        let store = fresh_store().await;
        let task = sample_task();
        store.insert_task(&task).await.unwrap();
        let now = Utc::now();
        let running = Job {
            id: Uuid::new_v4(),
            task_id: task.id,
            job_num: 1,
            queue: "default".into(),
            params: serde_json::json!({}),
            status: JobStatus::Running,
            progress: None,
            logs: vec![],
            scheduled_at: now,
            started_at: Some(now),
            finished_at: None,
            created_at: now,
            last_modified: now,
        };
        let mut done = running.clone();
        done.id = Uuid::new_v4();
        done.job_num = 2;
        done.status = JobStatus::Completed;
        store.insert_job(&running).await.unwrap();
        store.insert_job(&done).await.unwrap();

        let live = store.find_live_jobs_for_task(task.id).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, running.id);
    }
}
