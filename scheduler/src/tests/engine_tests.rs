//! Integration tests for the Scheduler Engine, covering the design's
//! worked scenarios end to end against real SQLite-backed stores.

use std::sync::Arc;

use core::broker::JobRunner;
use core::model::{JobStatus, TaskStatus};
use core::registry::{JobMeta, TaskDescriptor, TaskRegistry};
use core::store::{SqliteTaskStore, TaskStore};
use serde_json::{json, Value};
use tempfile::tempdir;
use uuid::Uuid;

use crate::broker_sqlite::SqliteBroker;
use crate::engine::{Engine, EngineJobRunner};

/// `add(a, b) -> a + b`, failing when `fail: true` is present in its
/// params, matching the design's worked-scenario task type.
struct AddTask;

#[async_trait::async_trait]
impl TaskDescriptor for AddTask {
    fn type_tag(&self) -> &'static str {
        "add"
    }

    fn default_job_queue(&self) -> &'static str {
        "t"
    }

    fn create_task(
        &self,
        id: Uuid,
        args: Value,
        job_interval: i64,
        job_max_retries: u32,
        burst: bool,
    ) -> core::error::Result<core::model::Task> {
        let now = chrono::Utc::now();
        Ok(core::model::Task {
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

    fn prepare_job_parameters(&self, task: &core::model::Task, _last_job: Option<&core::model::Job>) -> Value {
        task.args.clone()
    }

    async fn job_function(&self, params: Value, _meta: &JobMeta) -> core::error::Result<Value> {
        if params.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            return Err(core::error::Error::JobFailure("forced failure".to_string()));
        }
        let a = params.get("a").and_then(Value::as_i64).unwrap_or(0);
        let b = params.get("b").and_then(Value::as_i64).unwrap_or(0);
        Ok(json!(a + b))
    }
}

async fn build_engine(dir: &tempfile::TempDir) -> (Arc<Engine>, Arc<EngineJobRunner>, Arc<dyn TaskStore>) {
    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(dir.path().join("s.db")).await.unwrap());
    let broker = Arc::new(SqliteBroker::open(dir.path().join("s.db")).await.unwrap());
    let mut registry = TaskRegistry::new();
    registry.register(Arc::new(AddTask)).unwrap();
    let registry = Arc::new(registry);
    let config = core::config::SchedulerConfig::default();

    let engine = Engine::new(store.clone(), broker.clone(), registry.clone(), config.clone());
    let runner = EngineJobRunner::new(engine.clone(), store.clone(), registry, broker, config.job_timeout_seconds);
    (engine, runner, store)
}

async fn run_one_due_job(runner: &Arc<EngineJobRunner>, task_id: Uuid, store: &Arc<dyn TaskStore>) {
    let job = store.find_last_job_for_task(task_id).await.unwrap().unwrap();
    runner.run_job(job.id).await;
}

#[tokio::test]
async fn s1_successful_recurring_task() {
    let dir = tempdir().unwrap();
    let (engine, runner, store) = build_engine(&dir).await;

    let task = engine
        .schedule_task("add", json!({"a": 1, "b": 2}), 360, 10, false)
        .await
        .unwrap();

    run_one_due_job(&runner, task.id, &store).await;

    let task = store.find_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Enqueued);
    assert_eq!(task.runs, 1);
    assert_eq!(task.failures, 0);

    let jobs = store.find_jobs_for_task(task.id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    let completed = jobs.iter().find(|j| j.status == JobStatus::Completed).unwrap();
    assert_eq!(completed.progress, Some(json!(3)));
    let enqueued = jobs.iter().find(|j| j.status == JobStatus::Enqueued).unwrap();
    let expected_earliest = completed.finished_at.unwrap() + chrono::Duration::seconds(359);
    assert!(enqueued.scheduled_at >= expected_earliest);
}

#[tokio::test]
async fn s2_burst_mode_completes_without_rescheduling() {
    let dir = tempdir().unwrap();
    let (engine, runner, store) = build_engine(&dir).await;

    let task = engine
        .schedule_task("add", json!({"a": 1, "b": 2}), 360, 10, true)
        .await
        .unwrap();

    run_one_due_job(&runner, task.id, &store).await;

    let task = store.find_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let jobs = store.find_jobs_for_task(task.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);
}

#[tokio::test]
async fn s3_failure_under_retry_cap_goes_to_recovery() {
    let dir = tempdir().unwrap();
    let (engine, runner, store) = build_engine(&dir).await;

    let task = engine
        .schedule_task("add", json!({"fail": true}), 360, 10, false)
        .await
        .unwrap();

    run_one_due_job(&runner, task.id, &store).await;

    let task = store.find_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Recovery);
    assert_eq!(task.runs, 1);
    assert_eq!(task.failures, 1);

    let jobs = store.find_jobs_for_task(task.id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().any(|j| j.status == JobStatus::Failed));
    assert!(jobs.iter().any(|j| j.status == JobStatus::Enqueued));
}

#[tokio::test]
async fn s4_retry_exhaustion_fails_the_task() {
    let dir = tempdir().unwrap();
    let (engine, runner, store) = build_engine(&dir).await;

    let task = engine
        .schedule_task("add", json!({"fail": true}), 360, 3, false)
        .await
        .unwrap();

    // Pre-set runs/failures to 2, as the scenario calls for, by walking the
    // task through two failed attempts first.
    run_one_due_job(&runner, task.id, &store).await;
    run_one_due_job(&runner, task.id, &store).await;

    let mid = store.find_task(task.id).await.unwrap();
    assert_eq!(mid.runs, 2);
    assert_eq!(mid.failures, 2);
    assert_eq!(mid.status, TaskStatus::Recovery);

    run_one_due_job(&runner, task.id, &store).await;

    let task = store.find_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.runs, 3);
    assert_eq!(task.failures, 3);

    let jobs = store.find_jobs_for_task(task.id).await.unwrap();
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Failed));
    assert!(!jobs.iter().any(|j| j.status == JobStatus::Enqueued));
}

#[tokio::test]
async fn s5_orphaned_job_reconciliation() {
    let dir = tempdir().unwrap();
    let (engine, _runner, store) = build_engine(&dir).await;
    let broker = Arc::new(SqliteBroker::open(dir.path().join("s.db")).await.unwrap());

    let task = engine
        .schedule_task("add", json!({"a": 1, "b": 2}), 360, 10, false)
        .await
        .unwrap();

    let stale_job = store.find_last_job_for_task(task.id).await.unwrap().unwrap();
    // Simulate broker state loss by deleting its entry directly.
    broker.cancel(stale_job.id).await.unwrap();
    // `cancel` only deletes 'scheduled' rows, which this one still is, so
    // the broker now has no live entry for it -- exactly the orphan case.

    let repaired = engine.maintain_tasks().await.unwrap();
    assert_eq!(repaired, 1);

    let stale_job = store.find_job(stale_job.id).await.unwrap();
    assert_eq!(stale_job.status, JobStatus::Canceled);

    let jobs = store.find_jobs_for_task(task.id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    let fresh = jobs.iter().find(|j| j.id != stale_job.id).unwrap();
    assert_eq!(fresh.status, JobStatus::Enqueued);

    use core::broker::WorkBroker;
    assert!(broker.fetch(fresh.id).await.unwrap().is_some());
}

#[tokio::test]
async fn cancel_task_round_trips_to_canceled_with_no_live_broker_job() {
    let dir = tempdir().unwrap();
    let (engine, _runner, store) = build_engine(&dir).await;
    let broker = Arc::new(SqliteBroker::open(dir.path().join("s.db")).await.unwrap());

    let task = engine
        .schedule_task("add", json!({"a": 1, "b": 2}), 360, 10, false)
        .await
        .unwrap();

    engine.cancel_task(task.id).await.unwrap();

    let task = store.find_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);

    let jobs = store.find_jobs_for_task(task.id).await.unwrap();
    assert_eq!(jobs.len(), 1);

    use core::broker::WorkBroker;
    let record = broker.fetch(jobs[0].id).await.unwrap();
    assert!(record.is_none() || record.unwrap().state != core::broker::BrokerJobState::Scheduled);
}

#[tokio::test]
async fn reschedule_completed_task_enqueues_a_new_job_without_touching_old_ones() {
    let dir = tempdir().unwrap();
    let (engine, runner, store) = build_engine(&dir).await;

    let task = engine
        .schedule_task("add", json!({"a": 1, "b": 2}), 360, 10, true)
        .await
        .unwrap();
    run_one_due_job(&runner, task.id, &store).await;

    let task = store.find_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let old_jobs = store.find_jobs_for_task(task.id).await.unwrap();
    assert_eq!(old_jobs.len(), 1);

    let task = engine.reschedule_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Enqueued);

    let jobs = store.find_jobs_for_task(task.id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].id, old_jobs[0].id);
    assert_eq!(jobs[0].status, old_jobs[0].status);
}

#[tokio::test]
async fn success_callback_for_a_job_whose_task_was_canceled_bails_out() {
    let dir = tempdir().unwrap();
    let (engine, _runner, store) = build_engine(&dir).await;

    let task = engine
        .schedule_task("add", json!({"a": 1, "b": 2}), 360, 10, false)
        .await
        .unwrap();
    let job = store.find_last_job_for_task(task.id).await.unwrap().unwrap();

    // Simulate the worker already running this job when `cancel_task` fires:
    // the task and job are canceled, but the callback still arrives afterward.
    engine.cancel_task(task.id).await.unwrap();

    engine
        .on_success_callback(job.id, json!(3), Vec::new())
        .await
        .unwrap();

    let task = store.find_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);

    let jobs = store.find_jobs_for_task(task.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Canceled);
}

#[tokio::test]
async fn failure_callback_for_a_job_whose_task_was_canceled_bails_out() {
    let dir = tempdir().unwrap();
    let (engine, _runner, store) = build_engine(&dir).await;

    let task = engine
        .schedule_task("add", json!({"fail": true}), 360, 10, false)
        .await
        .unwrap();
    let job = store.find_last_job_for_task(task.id).await.unwrap().unwrap();

    engine.cancel_task(task.id).await.unwrap();

    engine
        .on_failure_callback(
            job.id,
            core::error::Error::JobFailure("forced failure".to_string()),
            None,
            Vec::new(),
        )
        .await
        .unwrap();

    let task = store.find_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);

    let jobs = store.find_jobs_for_task(task.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Canceled);
}
