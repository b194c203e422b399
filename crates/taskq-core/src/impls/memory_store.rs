//! MemoryStore - プロセス内の PersistenceProvider
//!
//! Keeps serialized records per queue name. Useful in tests and for
//! simulating a restart within one process: build a second queue over the
//! same store and call `load_persisted_tasks`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::domain::TaskId;
use crate::ports::{PersistenceError, PersistenceProvider};
use crate::queue::Task;

/// queue name → (task ID → serialized record)
#[derive(Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, BTreeMap<TaskId, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored task IDs of `queue_name`, sorted.
    pub fn task_ids(&self, queue_name: &str) -> Vec<TaskId> {
        self.lock()
            .get(queue_name)
            .map(|tasks| tasks.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, queue_name: &str) -> usize {
        self.lock().get(queue_name).map_or(0, BTreeMap::len)
    }

    /// Store a raw record as-is, bypassing serialization.
    pub fn insert_raw(&self, queue_name: &str, task_id: impl Into<TaskId>, raw: impl Into<String>) {
        self.lock()
            .entry(queue_name.to_string())
            .or_default()
            .insert(task_id.into(), raw.into());
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BTreeMap<TaskId, String>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistenceProvider for MemoryStore {
    fn save(&self, task: &Task, queue_name: &str) -> Result<(), PersistenceError> {
        let raw = task.serialize()?;
        self.insert_raw(queue_name, task.id().clone(), raw);
        Ok(())
    }

    fn load_all(&self, queue_name: &str) -> Result<Vec<String>, PersistenceError> {
        Ok(self
            .lock()
            .get(queue_name)
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default())
    }

    fn remove(&self, task_id: &TaskId, queue_name: &str) -> Result<(), PersistenceError> {
        if let Some(tasks) = self.lock().get_mut(queue_name) {
            tasks.remove(task_id);
        }
        Ok(())
    }
}
