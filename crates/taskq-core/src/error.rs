use thiserror::Error;

use crate::domain::TaskType;
use crate::ports::PersistenceError;

/// Errors raised while building or configuring a queue.
///
/// Per-task failures are [`crate::domain::TaskError`] and never surface here.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid queue config: {0}")]
    InvalidConfig(String),

    #[error("duplicate handler for task_type={0}")]
    DuplicateHandler(TaskType),

    #[error("duplicate coalescing handler for task_type={0}")]
    DuplicateCoalescer(TaskType),

    #[error("missing handlers for task types: {0:?}")]
    MissingHandlers(Vec<String>),

    #[error("queue must be built inside a tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
