//! Error kinds shared by the scheduler and the consumer pool.
//!
//! This is the Rust expression of the error table in the design: each
//! variant names one of the failure modes the core distinguishes and who is
//! expected to recover from it. `NotFound` and `Broker` propagate
//! synchronously to callers of `schedule_task`/`cancel_task`/etc; the rest
//! live on Job rows or drive the consumer pool's self-healing and are never
//! handed back to a caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("job failed: {0}")]
    JobFailure(String),

    #[error("task exhausted its retry budget")]
    TaskExhausted,

    #[error("task type does not support resuming after failure")]
    Nonresumable,

    #[error("stream connection error: {0}")]
    StreamConnection(String),

    #[error("sink rejected entry: {0}")]
    SinkRejection(String),

    #[error("sink raised an exception processing a batch: {0}")]
    SinkException(String),

    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("task type {0:?} is already registered")]
    DuplicateTaskType(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
