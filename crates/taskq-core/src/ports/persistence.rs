//! PersistenceProvider port - durable store of serialized tasks per queue.
//!
//! The queue keeps the stored set a mirror of its pending set: a task is saved
//! when admitted (and re-saved when it goes into retry), and removed when it
//! reaches a terminal state. Only the queue calls into the provider.

use thiserror::Error;

use crate::domain::TaskId;
use crate::queue::Task;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable key-value store of tasks, namespaced by queue name.
///
/// # 設計原則
/// - `save` is an idempotent upsert keyed by task ID.
/// - `remove` is an idempotent delete.
/// - `load_all` returns raw records; the queue skips malformed ones.
/// - Implementations must tolerate concurrent calls from several threads.
pub trait PersistenceProvider: Send + Sync {
    fn save(&self, task: &Task, queue_name: &str) -> Result<(), PersistenceError>;

    fn load_all(&self, queue_name: &str) -> Result<Vec<String>, PersistenceError>;

    fn remove(&self, task_id: &TaskId, queue_name: &str) -> Result<(), PersistenceError>;
}
