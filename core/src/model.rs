//! Task, Job and stream entry types.
//!
//! Task-type-specific attributes are not given their own tables. Instead a
//! task carries a free-form `args` object alongside the fields every task
//! shares; `TaskDescriptor::create_task` is responsible for shaping that
//! object the way a particular task type expects. This trades the
//! per-type-table design away in exchange for a single `tasks` table, which
//! keeps the store and the scheduler's maintenance queries uniform across
//! task types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    Enqueued,
    Running,
    Completed,
    Failed,
    Recovery,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::New => "new",
            TaskStatus::Enqueued => "enqueued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Recovery => "recovery",
            TaskStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "new" => TaskStatus::New,
            "enqueued" => TaskStatus::Enqueued,
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "recovery" => TaskStatus::Recovery,
            "canceled" => TaskStatus::Canceled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Enqueued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Enqueued => "enqueued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "enqueued" => JobStatus::Enqueued,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "canceled" => JobStatus::Canceled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

/// A unit of recurring or one-shot work tracked by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub args: Value,
    pub queue: String,
    pub status: TaskStatus,
    pub job_interval: i64,
    pub job_max_retries: u32,
    pub burst: bool,
    pub runs: u32,
    pub failures: u32,
    pub last_run: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Task {
    /// Stable external identifier, independent of storage backend.
    pub fn task_id(&self) -> String {
        format!("grimoire:task:{}", self.id)
    }

    pub fn is_recurring(&self) -> bool {
        self.job_interval > 0
    }
}

/// A single attempt at running a Task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task_id: Uuid,
    pub job_num: u32,
    pub queue: String,
    pub params: Value,
    pub status: JobStatus,
    pub progress: Option<Value>,
    pub logs: Vec<LogRecord>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Job {
    pub fn job_id(&self) -> String {
        format!("grimoire:job:{}", self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        LogRecord {
            timestamp: Utc::now(),
            level: level.into(),
            message: message.into(),
        }
    }
}

/// An entry read off an event stream, destined for a Sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEntry {
    pub message_id: String,
    pub payload: Value,
}
