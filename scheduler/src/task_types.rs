//! Example task-type registrations.
//!
//! `EchoTask` exists to exercise the scheduler's retry/burst/recurrence
//! machinery in isolation (it mirrors the `add(a, b) -> a + b` job function
//! from the design's worked scenarios). `FetchEventsTask` is the stand-in
//! for a real fetcher library per spec: its `job_function` is the seam
//! where a git/forge/mailing-list fetcher would normally run, and it
//! publishes synthetic normalized events onto the shared `EventStream` the
//! consumer pool drains, which is the only thing connecting the two halves
//! of this system.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use core::error::{Error, Result};
use core::model::{Task, TaskStatus};
use core::registry::{JobMeta, TaskDescriptor};
use core::stream::EventStream;
use serde_json::{json, Value};
use uuid::Uuid;

/// Numeric task used in tests and in the worked examples from the design:
/// its job function just adds two numbers together, so retry/backoff/burst
/// behavior can be exercised without any external dependency.
pub struct EchoTask;

#[async_trait]
impl TaskDescriptor for EchoTask {
    fn type_tag(&self) -> &'static str {
        "echo"
    }

    fn default_job_queue(&self) -> &'static str {
        "default"
    }

    fn create_task(
        &self,
        id: Uuid,
        args: Value,
        job_interval: i64,
        job_max_retries: u32,
        burst: bool,
    ) -> Result<Task> {
        let now = Utc::now();
        Ok(Task {
            id,
            task_type: self.type_tag().to_string(),
            args,
            queue: self.default_job_queue().to_string(),
            status: TaskStatus::New,
            job_interval,
            job_max_retries,
            burst,
            runs: 0,
            failures: 0,
            last_run: None,
            scheduled_at: None,
            created_at: now,
            last_modified: now,
        })
    }

    fn prepare_job_parameters(&self, task: &Task, _last_job: Option<&core::model::Job>) -> Value {
        task.args.clone()
    }

    fn can_be_retried(&self, task: &Task, _error: &Error) -> bool {
        task.failures < task.job_max_retries
    }

    async fn job_function(&self, params: Value, meta: &JobMeta) -> Result<Value> {
        let a = params.get("a").and_then(Value::as_i64).unwrap_or(0);
        let b = params.get("b").and_then(Value::as_i64).unwrap_or(0);
        if params.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            meta.log("error", "echo job was asked to fail");
            return Err(Error::JobFailure("echo task forced failure".to_string()));
        }
        meta.log("info", format!("adding {a} + {b}"));
        meta.set_progress(json!({"sum": a + b}));
        Ok(json!({"sum": a + b}))
    }
}

/// Fetcher-shaped task: each attempt "fetches" `batch_size` synthetic
/// events since the last completed job's `since` checkpoint and appends
/// them to the shared event stream. Resuming from `last_job.progress`
/// mirrors `backend.recovery_params(summary, prior_args)` in the original
/// `on_failure_callback`.
pub struct FetchEventsTask {
    stream: Arc<dyn EventStream>,
    stream_name: String,
}

impl FetchEventsTask {
    pub fn new(stream: Arc<dyn EventStream>, stream_name: String) -> Self {
        FetchEventsTask { stream, stream_name }
    }
}

#[async_trait]
impl TaskDescriptor for FetchEventsTask {
    fn type_tag(&self) -> &'static str {
        "fetch_events"
    }

    fn default_job_queue(&self) -> &'static str {
        "fetchers"
    }

    fn create_task(
        &self,
        id: Uuid,
        args: Value,
        job_interval: i64,
        job_max_retries: u32,
        burst: bool,
    ) -> Result<Task> {
        let now = Utc::now();
        Ok(Task {
            id,
            task_type: self.type_tag().to_string(),
            args,
            queue: self.default_job_queue().to_string(),
            status: TaskStatus::New,
            job_interval,
            job_max_retries,
            burst,
            runs: 0,
            failures: 0,
            last_run: None,
            scheduled_at: None,
            created_at: now,
            last_modified: now,
        })
    }

    fn prepare_job_parameters(&self, task: &Task, last_job: Option<&core::model::Job>) -> Value {
        let since = last_job
            .and_then(|j| j.progress.as_ref())
            .and_then(|p| p.get("last_event_at"))
            .cloned()
            .unwrap_or_else(|| json!(task.created_at.to_rfc3339()));

        let mut args = task.args.clone();
        if !args.is_object() {
            args = json!({});
        }
        args["since"] = since;
        args
    }

    fn can_be_retried(&self, task: &Task, _error: &Error) -> bool {
        let resumable = task
            .args
            .get("resumable")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        resumable && task.failures < task.job_max_retries
    }

    async fn job_function(&self, params: Value, meta: &JobMeta) -> Result<Value> {
        let batch_size = params.get("batch_size").and_then(Value::as_u64).unwrap_or(5);
        let datasource = params
            .get("datasource")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let since = params
            .get("since")
            .cloned()
            .unwrap_or_else(|| json!(Utc::now().to_rfc3339()));

        meta.log("info", format!("fetching up to {batch_size} events from {datasource} since {since}"));

        let mut last_event_at = Utc::now();
        let mut fetched = 0u64;
        for i in 0..batch_size {
            let event = json!({
                "id": format!("{}-{}", Uuid::new_v4(), i),
                "datasource": datasource,
                "data": {"message": format!("synthetic event {i} from {datasource}")},
                "time": last_event_at.to_rfc3339(),
            });
            self.stream
                .append(&self.stream_name, event)
                .await
                .map_err(|e| Error::JobFailure(format!("failed to publish event: {e}")))?;
            fetched += 1;
            last_event_at = Utc::now();
        }

        meta.set_progress(json!({
            "fetched": fetched,
            "last_event_at": last_event_at.to_rfc3339(),
        }));

        Ok(json!({"fetched": fetched}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::registry::TaskRegistry;

    #[tokio::test]
    async fn echo_task_adds_numbers() {
        let task_descriptor = EchoTask;
        let meta = JobMeta::default();
        let result = task_descriptor
            .job_function(json!({"a": 2, "b": 3}), &meta)
            .await
            .unwrap();
        assert_eq!(result, json!({"sum": 5}));
    }

    #[tokio::test]
    async fn echo_task_honors_the_fail_flag() {
        let task_descriptor = EchoTask;
        let meta = JobMeta::default();
        let err = task_descriptor
            .job_function(json!({"a": 1, "b": 1, "fail": true}), &meta)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JobFailure(_)));
    }

    #[tokio::test]
    async fn registry_rejects_duplicate_registration() {
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(EchoTask)).unwrap();
        let err = registry.register(Arc::new(EchoTask)).unwrap_err();
        assert!(matches!(err, Error::DuplicateTaskType(_)));
    }

    #[tokio::test]
    async fn fetch_events_task_publishes_to_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let stream: Arc<dyn EventStream> = Arc::new(
            core::stream_sqlite::SqliteEventStream::open(dir.path().join("s.db"))
                .await
                .unwrap(),
        );
        let task_descriptor = FetchEventsTask::new(stream.clone(), "events".to_string());
        let meta = JobMeta::default();
        let result = task_descriptor
            .job_function(json!({"batch_size": 3, "datasource": "git"}), &meta)
            .await
            .unwrap();
        assert_eq!(result, json!({"fetched": 3}));

        stream.ensure_group("events", "g").await.unwrap();
        let read = stream.read_new("events", "g", "c1", 10, 10).await.unwrap();
        assert_eq!(read.len(), 3);
    }
}
