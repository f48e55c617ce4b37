//! The Scheduler Engine: creates tasks, enqueues jobs, and owns the
//! success/failure callback pair and the reconciliation sweep.
//!
//! Grounded in `scheduler.py`'s `schedule_task` / `enqueue_task` /
//! `on_success_callback` / `on_failure_callback` quartet, restructured
//! around the registry-driven `TaskDescriptor` contract instead of a
//! hard-coded Perceval backend lookup. `maintain_tasks` has no equivalent in
//! the original (which relies on RQ's own persistence); it is the
//! self-healing sweep this design adds to survive a broker restart.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use core::broker::{EnqueueSpec, JobRunner, WorkBroker};
use core::config::SchedulerConfig;
use core::error::{Error, Result};
use core::model::{Job, JobStatus, Task, TaskStatus};
use core::registry::{JobMeta, TaskRegistry};
use core::store::{TaskStore, TaskUpdate};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct Engine {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn WorkBroker>,
    registry: Arc<TaskRegistry>,
    config: SchedulerConfig,
    /// Serializes `maintain_tasks` sweeps so two overlapping timer ticks (or
    /// a timer tick racing a manual admin call) can't both decide the same
    /// Task is orphaned and create two replacement Jobs.
    maintenance_lock: Mutex<()>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn WorkBroker>,
        registry: Arc<TaskRegistry>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Engine {
            store,
            broker,
            registry,
            config,
            maintenance_lock: Mutex::new(()),
        })
    }

    pub fn list_task_types(&self) -> Vec<String> {
        self.registry.types().into_iter().map(String::from).collect()
    }

    pub async fn find_tasks_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        self.store.find_tasks_by_status(statuses).await
    }

    /// `schedule_task` from the design: resolve the type, persist a new
    /// Task, and enqueue its first Job.
    pub async fn schedule_task(
        &self,
        task_type: &str,
        args: serde_json::Value,
        job_interval: i64,
        job_max_retries: u32,
        burst: bool,
    ) -> Result<Task> {
        let descriptor = self.registry.get(task_type)?;
        let id = Uuid::new_v4();
        let mut task = descriptor.create_task(id, args, job_interval, job_max_retries, burst)?;
        task.status = TaskStatus::New;
        self.store.insert_task(&task).await?;

        info!(task_id = %task.task_id(), task_type, "task scheduled");
        self.enqueue(&mut task, Utc::now()).await?;
        Ok(task)
    }

    /// Create the next Job for `task` and hand it to the broker. On broker
    /// failure both the Job and Task reach a terminal FAILED state rather
    /// than leaving a Task stuck in a transient status with no live broker
    /// entry (per the invariant in the design's enqueue flow).
    async fn enqueue(&self, task: &mut Task, scheduled_at: DateTime<Utc>) -> Result<Job> {
        let descriptor = self.registry.get(&task.task_type)?;
        let last_job = self.store.find_last_job_for_task(task.id).await?;
        let params = descriptor.prepare_job_parameters(task, last_job.as_ref());
        let queue = descriptor.default_job_queue().to_string();

        let job_num = self.store.find_jobs_for_task(task.id).await?.len() as u32 + 1;
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            task_id: task.id,
            job_num,
            queue: queue.clone(),
            params,
            status: JobStatus::Enqueued,
            progress: None,
            logs: Vec::new(),
            scheduled_at,
            started_at: None,
            finished_at: None,
            created_at: now,
            last_modified: now,
        };
        self.store.insert_job(&job).await?;

        let spec = EnqueueSpec {
            job_id: job.id,
            task_id: task.id,
            queue,
            run_time: scheduled_at,
            result_ttl_secs: self.config.job_result_ttl_seconds,
            job_timeout_secs: self.config.job_timeout_seconds,
        };

        match self.broker.enqueue_at(spec).await {
            Ok(()) => {
                task.status = TaskStatus::Enqueued;
                task.scheduled_at = Some(scheduled_at);
                self.store.save_task(task).await?;
                debug!(task_id = %task.task_id(), job_id = %job.id, %scheduled_at, "job enqueued");
                Ok(job)
            }
            Err(e) => {
                warn!(task_id = %task.task_id(), error = %e, "broker rejected enqueue_at");
                self.store
                    .save_run(
                        job.id,
                        JobStatus::Failed,
                        None,
                        Vec::new(),
                        TaskUpdate {
                            status: TaskStatus::Failed,
                            scheduled_at: None,
                            bump_runs: false,
                            bump_failures: false,
                            reset_failures: false,
                        },
                    )
                    .await?;
                Err(Error::Broker(e.to_string()))
            }
        }
    }

    /// `cancel_task`: cancel every non-terminal Job of the Task (the design
    /// treats "multiple running jobs per task" as a latent bug to tolerate
    /// rather than assume away).
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<()> {
        let mut task = self.store.find_task(task_id).await?;
        let live_jobs = self.store.find_live_jobs_for_task(task_id).await?;
        for job in &live_jobs {
            if let Err(e) = self.broker.cancel(job.id).await {
                warn!(job_id = %job.id, error = %e, "broker cancel failed, marking job canceled anyway");
            }
            self.store.mark_job_canceled(job.id).await?;
        }
        task.status = TaskStatus::Canceled;
        self.store.save_task(&task).await?;
        info!(task_id = %task.task_id(), "task canceled");
        Ok(())
    }

    /// `reschedule_task`: cancel any live broker entry and enqueue a fresh
    /// Job at `now`, regardless of the Task's current status.
    pub async fn reschedule_task(&self, task_id: Uuid) -> Result<Task> {
        let mut task = self.store.find_task(task_id).await?;
        if matches!(task.status, TaskStatus::Enqueued | TaskStatus::Running) {
            for job in self.store.find_live_jobs_for_task(task_id).await? {
                let _ = self.broker.cancel(job.id).await;
                self.store.mark_job_canceled(job.id).await?;
            }
        }
        self.enqueue(&mut task, Utc::now()).await?;
        info!(task_id = %task.task_id(), "task rescheduled");
        Ok(task)
    }

    /// Default `on_success_callback`: persist the completed Job, then either
    /// finish a burst Task or enqueue the next recurring attempt.
    pub async fn on_success_callback(&self, job_id: Uuid, result: serde_json::Value, logs: Vec<core::model::LogRecord>) -> Result<()> {
        let job = match self.store.find_job(job_id).await {
            Ok(j) => j,
            Err(Error::NotFound { .. }) => {
                warn!(%job_id, "success callback for unknown job, ignoring");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut task = self.store.find_task(job.task_id).await?;

        if task.status == TaskStatus::Canceled {
            debug!(task_id = %task.task_id(), %job_id, "success callback for canceled task, bailing out without mutating it");
            return Ok(());
        }

        if task.burst {
            self.store
                .save_run(
                    job.id,
                    JobStatus::Completed,
                    Some(result),
                    logs,
                    TaskUpdate {
                        status: TaskStatus::Completed,
                        scheduled_at: None,
                        bump_runs: true,
                        bump_failures: false,
                        reset_failures: true,
                    },
                )
                .await?;
            info!(task_id = %task.task_id(), %job_id, "burst task completed");
            return Ok(());
        }

        task = self
            .store
            .save_run(
                job.id,
                JobStatus::Completed,
                Some(result),
                logs,
                TaskUpdate {
                    status: TaskStatus::Completed,
                    scheduled_at: None,
                    bump_runs: true,
                    bump_failures: false,
                    reset_failures: true,
                },
            )
            .await?;

        let next_run = Utc::now() + ChronoDuration::seconds(task.job_interval.max(0));
        self.enqueue(&mut task, next_run).await?;
        Ok(())
    }

    /// Default `on_failure_callback`: persist the failed Job, then decide
    /// between terminal FAILED and a RECOVERY re-enqueue based on the retry
    /// budget and the task type's `can_be_retried` gate.
    pub async fn on_failure_callback(
        &self,
        job_id: Uuid,
        error: Error,
        progress: Option<serde_json::Value>,
        logs: Vec<core::model::LogRecord>,
    ) -> Result<()> {
        let job = match self.store.find_job(job_id).await {
            Ok(j) => j,
            Err(Error::NotFound { .. }) => {
                warn!(%job_id, "failure callback for unknown job, ignoring");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut task = self.store.find_task(job.task_id).await?;

        if task.status == TaskStatus::Canceled {
            debug!(task_id = %task.task_id(), %job_id, "failure callback for canceled task, bailing out without mutating it");
            return Ok(());
        }

        error!(task_id = %task.task_id(), %job_id, error = %error, "job failed");

        let failures_after = task.failures + 1;
        let exhausted = failures_after >= task.job_max_retries;
        let descriptor = self.registry.get(&task.task_type)?;
        let resumable = descriptor.can_be_retried(&task, &error);

        if exhausted || !resumable {
            task = self
                .store
                .save_run(
                    job.id,
                    JobStatus::Failed,
                    progress,
                    logs,
                    TaskUpdate {
                        status: TaskStatus::Failed,
                        scheduled_at: None,
                        bump_runs: true,
                        bump_failures: true,
                        reset_failures: false,
                    },
                )
                .await?;
            if !resumable {
                warn!(task_id = %task.task_id(), "task type refused retry, task failed");
            } else {
                warn!(task_id = %task.task_id(), failures = task.failures, "retry budget exhausted, task failed");
            }
            return Ok(());
        }

        task = self
            .store
            .save_run(
                job.id,
                JobStatus::Failed,
                progress,
                logs,
                TaskUpdate {
                    status: TaskStatus::Recovery,
                    scheduled_at: None,
                    bump_runs: true,
                    bump_failures: true,
                    reset_failures: false,
                },
            )
            .await?;

        let next_run = Utc::now() + ChronoDuration::seconds(self.config.recovery_delay_seconds.max(0));
        self.enqueue(&mut task, next_run).await?;
        Ok(())
    }

    /// Self-healing sweep (§4.D): for every Task that should have a live
    /// Job, verify the broker agrees; if not, cancel the stale Job row and
    /// create a replacement. Serialized by `maintenance_lock` so concurrent
    /// sweeps never double-replace the same orphan.
    pub async fn maintain_tasks(&self) -> Result<usize> {
        let _guard = self.maintenance_lock.lock().await;
        let mut repaired = 0usize;

        let tasks = self
            .store
            .find_tasks_by_status(&[TaskStatus::Enqueued, TaskStatus::Running, TaskStatus::Recovery])
            .await?;

        for mut task in tasks {
            let last_job = self.store.find_last_job_for_task(task.id).await?;
            let orphaned = match &last_job {
                None => true,
                Some(job) if job.status.is_terminal() => true,
                Some(job) => self.broker.fetch(job.id).await?.is_none(),
            };

            if !orphaned {
                continue;
            }

            if let Some(job) = &last_job {
                if !job.status.is_terminal() {
                    self.store.mark_job_canceled(job.id).await?;
                    warn!(task_id = %task.task_id(), job_id = %job.id, "orphaned job canceled by maintenance sweep");
                }
            }

            let scheduled_at = match task.scheduled_at {
                Some(t) if t > Utc::now() => t,
                _ => Utc::now(),
            };
            self.enqueue(&mut task, scheduled_at).await?;
            repaired += 1;
        }

        if repaired > 0 {
            info!(repaired, "maintenance sweep repaired orphaned tasks");
        }
        Ok(repaired)
    }
}

/// Bridges the broker's job-identity-only callback surface back to the
/// Engine's typed success/failure callbacks. One `JobRunner` per process;
/// the broker hands it a bare job id and this re-resolves everything else
/// from the store and registry, matching the design note that callback
/// identity (not closed-over state) is what crosses the broker boundary.
pub struct EngineJobRunner {
    engine: Arc<Engine>,
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    broker: Arc<dyn WorkBroker>,
    job_timeout_secs: i64,
}

impl EngineJobRunner {
    pub fn new(
        engine: Arc<Engine>,
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskRegistry>,
        broker: Arc<dyn WorkBroker>,
        job_timeout_secs: i64,
    ) -> Arc<Self> {
        Arc::new(EngineJobRunner {
            engine,
            store,
            registry,
            broker,
            job_timeout_secs,
        })
    }
}

#[async_trait::async_trait]
impl JobRunner for EngineJobRunner {
    async fn run_job(&self, job_id: Uuid) {
        let job = match self.store.find_job(job_id).await {
            Ok(j) => j,
            Err(e) => {
                error!(%job_id, error = %e, "runner could not load job, dropping");
                return;
            }
        };
        let task = match self.store.find_task(job.task_id).await {
            Ok(t) => t,
            Err(e) => {
                error!(%job_id, error = %e, "runner could not load owning task, dropping");
                return;
            }
        };

        if task.status == TaskStatus::Canceled {
            debug!(%job_id, task_id = %task.task_id(), "job belongs to canceled task, skipping");
            let _ = self.broker.mark_finished(job_id).await;
            return;
        }

        if let Err(e) = self.store.mark_job_running(job_id).await {
            error!(%job_id, error = %e, "failed to mark job running");
        }

        let descriptor = match self.registry.get(&task.task_type) {
            Ok(d) => d,
            Err(e) => {
                error!(%job_id, error = %e, "unknown task type at run time");
                let _ = self.engine.on_failure_callback(job_id, e, None, Vec::new()).await;
                let _ = self.broker.mark_finished(job_id).await;
                return;
            }
        };

        let meta = JobMeta::default();
        let timeout = std::time::Duration::from_secs(self.job_timeout_secs.max(1) as u64);
        let outcome = tokio::time::timeout(timeout, descriptor.job_function(job.params.clone(), &meta)).await;

        match outcome {
            Ok(Ok(result)) => {
                if let Err(e) = self
                    .engine
                    .on_success_callback(job_id, result, meta.take_logs())
                    .await
                {
                    error!(%job_id, error = %e, "success callback failed");
                }
            }
            Ok(Err(e)) => {
                let progress = meta.take_progress();
                if let Err(e2) = self
                    .engine
                    .on_failure_callback(job_id, e, progress, meta.take_logs())
                    .await
                {
                    error!(%job_id, error = %e2, "failure callback failed");
                }
            }
            Err(_) => {
                let progress = meta.take_progress();
                let err = Error::JobFailure(format!("job exceeded {}s timeout", self.job_timeout_secs));
                if let Err(e2) = self
                    .engine
                    .on_failure_callback(job_id, err, progress, meta.take_logs())
                    .await
                {
                    error!(%job_id, error = %e2, "failure callback failed after timeout");
                }
            }
        }

        let _ = self.broker.mark_finished(job_id).await;
    }
}
