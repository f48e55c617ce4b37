//! Work Broker Adapter: the boundary between the scheduler and whatever
//! actually runs jobs at their scheduled time.
//!
//! The broker only ever sees a job's identity and its queue/run time; it
//! never holds a callback closure across that boundary, since a delayed
//! job's continuation has to survive a process restart. Instead, when a
//! job comes due the broker hands the job's uuid to a `JobRunner`, which
//! re-resolves the task type from the registry, runs `job_function`, and
//! always finishes by invoking the scheduler's own success/failure
//! callback -- mirroring `django_rq`'s `enqueue_at(..., on_success=...,
//! on_failure=...)` pair, but keeping the function references on this
//! side of the boundary instead of serialized into the queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct EnqueueSpec {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub queue: String,
    pub run_time: DateTime<Utc>,
    pub result_ttl_secs: i64,
    pub job_timeout_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerJobState {
    Scheduled,
    Queued,
    Running,
    Finished,
}

#[derive(Debug, Clone)]
pub struct BrokerJobRecord {
    pub job_id: Uuid,
    pub queue: String,
    pub run_time: DateTime<Utc>,
    pub state: BrokerJobState,
}

/// Invoked by the broker once a job is due. Implementations must never
/// panic or propagate an error out of `run_job` -- all outcomes, including
/// the job function raising, are folded into the scheduler's own
/// bookkeeping via the success/failure callback.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, job_id: Uuid);
}

#[async_trait]
pub trait WorkBroker: Send + Sync {
    /// Schedule a job to run at `spec.run_time`. Idempotent: re-enqueuing
    /// the same `job_id` replaces its run time rather than creating a
    /// duplicate entry.
    async fn enqueue_at(&self, spec: EnqueueSpec) -> Result<()>;

    /// Look up a job's current state in the broker, if it still has one.
    async fn fetch(&self, job_id: Uuid) -> Result<Option<BrokerJobRecord>>;

    /// Remove a job from the broker before it has run. A no-op if the job
    /// already started or was never enqueued.
    async fn cancel(&self, job_id: Uuid) -> Result<()>;

    /// Mark a job as finished so it stops showing up as due or running.
    /// Called once a `JobRunner` has finished one way or another.
    async fn mark_finished(&self, job_id: Uuid) -> Result<()>;

    /// Health check used by maintenance sweeps and the CLI's `status`
    /// subcommand.
    async fn ping(&self) -> Result<()>;
}
