//! Task-type plugin contract and registry.
//!
//! Task types are looked up by tag against a dispatch table populated at
//! startup instead of hard-coded, so a binary (the scheduler or a
//! consumer) can register whichever task types it knows how to run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Job, Task};

/// Mutable scratch space a running job can publish progress/log lines to.
/// The scheduler copies its contents onto the Job row when the job reaches
/// a terminal state, win or lose, so a failed job still records whatever
/// progress it made before failing.
#[derive(Debug, Default)]
pub struct JobMeta {
    progress: Mutex<Option<Value>>,
    logs: Mutex<Vec<crate::model::LogRecord>>,
}

impl JobMeta {
    pub fn set_progress(&self, value: Value) {
        *self.progress.lock().unwrap() = Some(value);
    }

    pub fn log(&self, level: impl Into<String>, message: impl Into<String>) {
        self.logs
            .lock()
            .unwrap()
            .push(crate::model::LogRecord::new(level, message));
    }

    pub fn take_progress(&self) -> Option<Value> {
        self.progress.lock().unwrap().clone()
    }

    pub fn take_logs(&self) -> Vec<crate::model::LogRecord> {
        std::mem::take(&mut self.logs.lock().unwrap())
    }
}

/// The five behaviors a task type must supply, named after the contract in
/// the design: how to build a task, how to build the next job's parameters,
/// whether a failed task is worth retrying, which queue it runs on by
/// default, and the job body itself.
#[async_trait]
pub trait TaskDescriptor: Send + Sync {
    fn type_tag(&self) -> &'static str;

    fn default_job_queue(&self) -> &'static str;

    /// Build a new Task value from caller-supplied arguments. Does not
    /// persist it; the scheduler engine owns storage.
    fn create_task(
        &self,
        id: Uuid,
        args: Value,
        job_interval: i64,
        job_max_retries: u32,
        burst: bool,
    ) -> Result<Task>;

    /// Build the parameters the next Job should run with, given the Task
    /// and (if any) the most recent prior Job, e.g. to resume from a
    /// checkpoint left in `last_job.progress`.
    fn prepare_job_parameters(&self, task: &Task, last_job: Option<&Job>) -> Value;

    /// Whether a Task that just failed is eligible for another attempt.
    /// Most task types simply check `task.failures < task.job_max_retries`;
    /// a type may refuse retries for errors it knows are not transient.
    fn can_be_retried(&self, task: &Task, error: &Error) -> bool {
        let _ = error;
        task.failures < task.job_max_retries
    }

    /// Run one job attempt. `meta` is shared with the scheduler so
    /// progress/log lines survive even if this call returns an error.
    async fn job_function(&self, params: Value, meta: &JobMeta) -> Result<Value>;
}

/// Lookup table of task types a binary is willing to run.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    descriptors: HashMap<String, Arc<dyn TaskDescriptor>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: Arc<dyn TaskDescriptor>) -> Result<()> {
        let tag = descriptor.type_tag().to_string();
        if self.descriptors.contains_key(&tag) {
            return Err(Error::DuplicateTaskType(tag));
        }
        self.descriptors.insert(tag, descriptor);
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Result<Arc<dyn TaskDescriptor>> {
        self.descriptors
            .get(task_type)
            .cloned()
            .ok_or_else(|| Error::UnknownTaskType(task_type.to_string()))
    }

    pub fn types(&self) -> Vec<&str> {
        self.descriptors.keys().map(|s| s.as_str()).collect()
    }
}
