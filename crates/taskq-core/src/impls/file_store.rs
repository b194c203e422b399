//! JsonFileStore - ディレクトリ配下の JSON ファイルに保存する PersistenceProvider
//!
//! One file per queue, `<dir>/<queue name>.json`, holding a JSON array of
//! task records. Every write rewrites the file through a temporary file and
//! a rename, so a crash leaves either the old or the new contents.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::domain::{TaskId, TaskRecord};
use crate::ports::{PersistenceError, PersistenceProvider};
use crate::queue::Task;

pub struct JsonFileStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles across threads.
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, queue_name: &str) -> PathBuf {
        let file: String = queue_name
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '\0' => '_',
                c => c,
            })
            .collect();
        self.dir.join(format!("{file}.json"))
    }

    fn read(&self, queue_name: &str) -> Result<Vec<serde_json::Value>, PersistenceError> {
        match fs::read_to_string(self.path_for(queue_name)) {
            Ok(raw) if raw.trim().is_empty() => Ok(Vec::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, queue_name: &str, records: &[serde_json::Value]) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(queue_name);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(records)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn update<F>(&self, queue_name: &str, f: F) -> Result<(), PersistenceError>
    where
        F: FnOnce(&mut Vec<serde_json::Value>) -> Result<(), PersistenceError>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = self.read(queue_name)?;
        f(&mut records)?;
        self.write(queue_name, &records)
    }
}

fn record_id(record: &serde_json::Value) -> Option<&str> {
    record.get("taskID").and_then(serde_json::Value::as_str)
}

impl PersistenceProvider for JsonFileStore {
    fn save(&self, task: &Task, queue_name: &str) -> Result<(), PersistenceError> {
        let record = serde_json::to_value(task.to_record())?;
        self.update(queue_name, |records| {
            match records
                .iter_mut()
                .find(|r| record_id(r) == Some(task.id().as_str()))
            {
                Some(existing) => *existing = record,
                None => records.push(record),
            }
            Ok(())
        })
    }

    /// Entries are returned as raw JSON; the queue decides which are valid.
    fn load_all(&self, queue_name: &str) -> Result<Vec<String>, PersistenceError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read(queue_name)?
            .iter()
            .map(|record| serde_json::to_string(record).map_err(PersistenceError::from))
            .collect()
    }

    fn remove(&self, task_id: &TaskId, queue_name: &str) -> Result<(), PersistenceError> {
        self.update(queue_name, |records| {
            records.retain(|r| record_id(r) != Some(task_id.as_str()));
            Ok(())
        })
    }
}

impl std::fmt::Debug for JsonFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonFileStore").field("dir", &self.dir).finish()
    }
}
