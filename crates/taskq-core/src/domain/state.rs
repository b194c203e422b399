//! State - lifecycle of a task inside a queue.

use serde::{Deserialize, Serialize};

/// Task lifecycle.
///
/// State transitions:
/// - Created -> Ready -> Executing -> Finished
/// - Executing -> RetryWait -> Ready -> Executing (until retries are exhausted)
/// - any non-terminal state -> Cancelled
///
/// `Created` covers both "not submitted yet" and "submitted, waiting on
/// dependencies". `RetryWait` never occupies a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    Ready,
    Executing,
    RetryWait,
    Finished,
    Cancelled,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Cancelled)
    }

    /// Not running and not terminal: a candidate for coalescing.
    pub fn is_idle(self) -> bool {
        matches!(
            self,
            TaskState::Created | TaskState::Ready | TaskState::RetryWait
        )
    }
}
