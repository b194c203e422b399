//! Errors - terminal and transient failure kinds of a task.

use thiserror::Error;

use super::{TaskId, TaskType};

/// Failure kinds a task can carry as its `last_error`.
///
/// - `Failed`: reported by a handler; retried with backoff.
/// - `NoHandler`, `RetriesExhausted`, `Cancelled`, `Coalesced`: terminal, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("no handler registered for task type '{task_type}'")]
    NoHandler { task_type: TaskType },

    #[error("retries exhausted after {retries} attempts: {last}")]
    RetriesExhausted { retries: u32, last: Box<TaskError> },

    #[error("task cancelled")]
    Cancelled,

    #[error("task coalesced into {into}")]
    Coalesced { into: TaskId },
}

impl TaskError {
    /// Handler failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Explicit or coalescing-induced cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Coalesced { .. })
    }

    /// Only handler failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}
