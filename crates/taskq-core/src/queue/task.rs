//! Task - a unit of work and its lifecycle.
//!
//! A [`Task`] is a cheap, clonable handle. Identity, payload, and dependencies
//! are immutable; the mutable lifecycle lives behind a per-task mutex.
//!
//! Lock order: the queue state lock may be held while a task lock is taken,
//! never the other way around. Every method here that calls back into the
//! queue releases the task lock first.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;

use super::{Queue, QueueInner};
use crate::domain::record::truncate_millis;
use crate::domain::{
    QueuePriority, ServiceClass, TaskError, TaskId, TaskRecord, TaskState, TaskType,
};
use crate::ports::{IdGenerator, LogLevel, SystemClock, UlidGenerator};

#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    id: TaskId,
    task_type: TaskType,
    payload: serde_json::Value,
    dependencies: Vec<TaskId>,
    queue_priority: QueuePriority,
    service_class: ServiceClass,
    created: DateTime<Utc>,

    /// Non-owning back-reference, set once when the task is deserialized for
    /// or admitted into a queue.
    queue: OnceLock<Weak<QueueInner>>,

    progress: Mutex<Progress>,
}

struct Progress {
    state: TaskState,
    started: Option<DateTime<Utc>>,
    retry_count: u32,
    last_error: Option<TaskError>,

    /// Occupies one of the queue's `max_concurrency` slots.
    holds_slot: bool,

    /// Pending backoff timer while in `RetryWait`.
    retry_timer: Option<AbortHandle>,
}

/// What a `completed` call resolved to, decided under the task lock.
enum Completion {
    Finished,
    Retry(u32),
    Terminal,
}

impl Task {
    pub fn builder(task_type: impl Into<TaskType>) -> TaskBuilder {
        TaskBuilder::new(task_type)
    }

    pub fn id(&self) -> &TaskId {
        &self.inner.id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.inner.task_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.inner.payload
    }

    /// Declared dependency IDs, in declaration order.
    pub fn dependencies(&self) -> &[TaskId] {
        &self.inner.dependencies
    }

    pub fn queue_priority(&self) -> QueuePriority {
        self.inner.queue_priority
    }

    pub fn service_class(&self) -> ServiceClass {
        self.inner.service_class
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.inner.created
    }

    pub fn started(&self) -> Option<DateTime<Utc>> {
        self.progress().started
    }

    pub fn retry_count(&self) -> u32 {
        self.progress().retry_count
    }

    pub fn last_error(&self) -> Option<TaskError> {
        self.progress().last_error.clone()
    }

    pub fn state(&self) -> TaskState {
        self.progress().state
    }

    pub fn is_executing(&self) -> bool {
        self.state() == TaskState::Executing
    }

    /// True for both successful and cancelled tasks.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// Same underlying task (not just the same ID).
    pub fn ptr_eq(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Single completion entry point for handlers, callable from any thread.
    ///
    /// - `None`: the task finishes successfully.
    /// - `Some(err)`: the attempt failed. Retryable errors are retried with
    ///   backoff until the queue's `max_retries` failed attempts, then the task
    ///   is cancelled with [`TaskError::RetriesExhausted`].
    ///
    /// Ignored (and logged) unless the task is currently executing, so a late
    /// or duplicate call is harmless.
    pub fn completed(&self, error: Option<TaskError>) {
        let queue = self.queue();
        let max_retries = queue.as_ref().map(|q| q.max_retries()).unwrap_or(0);

        let completion = {
            let mut progress = self.progress();
            if progress.state != TaskState::Executing {
                let state = progress.state;
                drop(progress);
                self.log(
                    LogLevel::Warning,
                    &format!(
                        "Ignoring completion of task {} in state {state:?}",
                        self.inner.id
                    ),
                );
                return;
            }

            match error {
                None => {
                    progress.state = TaskState::Finished;
                    progress.last_error = None;
                    Completion::Finished
                }
                Some(err) => {
                    progress.retry_count += 1;
                    let retries = progress.retry_count;
                    if !err.is_retryable() {
                        progress.state = TaskState::Cancelled;
                        progress.last_error = Some(err);
                        Completion::Terminal
                    } else if retries >= max_retries {
                        progress.state = TaskState::Cancelled;
                        progress.last_error = Some(TaskError::RetriesExhausted {
                            retries,
                            last: Box::new(err),
                        });
                        Completion::Terminal
                    } else {
                        progress.state = TaskState::RetryWait;
                        progress.last_error = Some(err);
                        Completion::Retry(retries)
                    }
                }
            }
        };

        let Some(queue) = queue else {
            return;
        };
        match completion {
            Completion::Finished | Completion::Terminal => queue.on_terminal(self),
            Completion::Retry(retries) => queue.schedule_retry(self, retries),
        }
    }

    /// Cancel from any state. Not retried; an in-flight handler is not
    /// interrupted, its later `completed` call is ignored.
    pub fn cancel(&self) {
        self.cancel_with(TaskError::Cancelled);
    }

    /// Returns false if the task was already terminal.
    pub(crate) fn cancel_with(&self, error: TaskError) -> bool {
        if !self.mark_cancelled(error) {
            return false;
        }
        if let Some(queue) = self.queue() {
            queue.on_terminal(self);
        }
        true
    }

    /// Cancelled transition only; the caller retires the task from its queue.
    /// Safe to call with the queue state lock held.
    pub(crate) fn mark_cancelled(&self, error: TaskError) -> bool {
        let mut progress = self.progress();
        if progress.state.is_terminal() {
            return false;
        }
        progress.state = TaskState::Cancelled;
        progress.last_error = Some(error);
        if let Some(timer) = progress.retry_timer.take() {
            timer.abort();
        }
        true
    }

    /// Resolve declared dependency IDs against `candidates`.
    ///
    /// Missing IDs are logged and dropped; a dangling reference is unmet, not
    /// an error.
    pub fn setup_dependencies(&self, candidates: &[Task]) -> Vec<Task> {
        let mut found = Vec::with_capacity(self.inner.dependencies.len());
        for dep_id in &self.inner.dependencies {
            match candidates.iter().find(|t| t.id() == dep_id) {
                Some(dep) => found.push(dep.clone()),
                None => self.log(
                    LogLevel::Warning,
                    &format!(
                        "Discarding missing dependency {dep_id} from {}",
                        self.inner.id
                    ),
                ),
            }
        }
        found
    }

    pub fn to_record(&self) -> TaskRecord {
        let progress = self.progress();
        TaskRecord {
            task_id: self.inner.id.clone(),
            task_type: self.inner.task_type.clone(),
            dependencies: self.inner.dependencies.clone(),
            queue_priority: self.inner.queue_priority,
            service_class: self.inner.service_class,
            data: self.inner.payload.clone(),
            created: self.inner.created,
            started: progress.started,
            retries: progress.retry_count,
        }
    }

    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        self.to_record().to_json()
    }

    /// Parse a persisted record for `queue`. A malformed record yields `None`
    /// (logged), never a partially populated task.
    pub fn deserialize(raw: &str, queue: &Queue) -> Option<Task> {
        match TaskRecord::from_json(raw) {
            Ok(record) => {
                let task = Task::from_record(record);
                task.attach(queue);
                Some(task)
            }
            Err(e) => {
                queue.log(
                    LogLevel::Error,
                    &format!("Skipping malformed task record in queue {}: {e}", queue.name()),
                );
                None
            }
        }
    }

    pub fn from_record(record: TaskRecord) -> Task {
        Task::from_parts(
            record.task_id,
            record.task_type,
            record.data,
            record.dependencies,
            record.queue_priority,
            record.service_class,
            record.created,
            Progress {
                state: TaskState::Created,
                started: record.started,
                retry_count: record.retries,
                last_error: None,
                holds_slot: false,
                retry_timer: None,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn from_parts(
        id: TaskId,
        task_type: TaskType,
        payload: serde_json::Value,
        dependencies: Vec<TaskId>,
        queue_priority: QueuePriority,
        service_class: ServiceClass,
        created: DateTime<Utc>,
        progress: Progress,
    ) -> Task {
        Task {
            inner: Arc::new(TaskInner {
                id,
                task_type,
                payload,
                dependencies: dedup_ordered(dependencies),
                queue_priority,
                service_class,
                created,
                queue: OnceLock::new(),
                progress: Mutex::new(progress),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Queue-facing transitions
    // ------------------------------------------------------------------

    /// Bind to `queue`. False if the task already belongs to another queue.
    pub(crate) fn attach(&self, queue: &Queue) -> bool {
        let weak = queue.downgrade();
        let bound = self.inner.queue.get_or_init(|| weak.clone());
        Weak::ptr_eq(bound, &weak)
    }

    pub(crate) fn queue(&self) -> Option<Queue> {
        self.inner.queue.get().and_then(Queue::upgrade)
    }

    /// Created / RetryWait -> Ready.
    pub(crate) fn mark_ready(&self) -> bool {
        let mut progress = self.progress();
        match progress.state {
            TaskState::Created | TaskState::RetryWait => {
                progress.state = TaskState::Ready;
                true
            }
            _ => false,
        }
    }

    /// Ready -> Executing, taking a worker slot. Records the first start time.
    pub(crate) fn start(&self, now: DateTime<Utc>) -> bool {
        let mut progress = self.progress();
        if progress.state != TaskState::Ready {
            return false;
        }
        progress.state = TaskState::Executing;
        progress.holds_slot = true;
        progress.started.get_or_insert(truncate_millis(now));
        true
    }

    /// Give up the worker slot, if held. Returns whether it was held.
    pub(crate) fn take_slot(&self) -> bool {
        std::mem::take(&mut self.progress().holds_slot)
    }

    pub(crate) fn set_retry_timer(&self, timer: AbortHandle) {
        let mut progress = self.progress();
        if progress.state.is_terminal() {
            timer.abort();
        } else {
            progress.retry_timer = Some(timer);
        }
    }

    pub(crate) fn log(&self, level: LogLevel, message: &str) {
        if let Some(queue) = self.queue() {
            queue.log(level, message);
        }
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.inner
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let progress = self.progress();
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("task_type", &self.inner.task_type)
            .field("dependencies", &self.inner.dependencies)
            .field("state", &progress.state)
            .field("retry_count", &progress.retry_count)
            .field("last_error", &progress.last_error)
            .finish()
    }
}

fn dedup_ordered(ids: Vec<TaskId>) -> Vec<TaskId> {
    let mut out: Vec<TaskId> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

/// Builder for new tasks.
///
/// # 使用例
/// ```ignore
/// let task = Task::builder("upload")
///     .id("upload-42")
///     .payload(json!({"path": "/tmp/a.png"}))
///     .depends_on("resize-42")
///     .build();
/// ```
pub struct TaskBuilder {
    id: Option<TaskId>,
    task_type: TaskType,
    payload: serde_json::Value,
    dependencies: Vec<TaskId>,
    queue_priority: QueuePriority,
    service_class: ServiceClass,
    created: Option<DateTime<Utc>>,
}

impl TaskBuilder {
    pub fn new(task_type: impl Into<TaskType>) -> Self {
        Self {
            id: None,
            task_type: task_type.into(),
            payload: serde_json::Value::Object(Default::default()),
            dependencies: Vec::new(),
            queue_priority: QueuePriority::default(),
            service_class: ServiceClass::default(),
            created: None,
        }
    }

    /// Caller-supplied ID. Without one a ULID based ID is generated.
    pub fn id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn dependencies<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn priority(mut self, priority: QueuePriority) -> Self {
        self.queue_priority = priority;
        self
    }

    pub fn service_class(mut self, service_class: ServiceClass) -> Self {
        self.service_class = service_class;
        self
    }

    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        self.created = Some(at);
        self
    }

    pub fn build(self) -> Task {
        self.build_with(&UlidGenerator::new(SystemClock))
    }

    pub fn build_with(self, ids: &dyn IdGenerator) -> Task {
        let id = self.id.unwrap_or_else(|| ids.generate_task_id());
        let created = truncate_millis(self.created.unwrap_or_else(Utc::now));
        Task::from_parts(
            id,
            self.task_type,
            self.payload,
            self.dependencies,
            self.queue_priority,
            self.service_class,
            created,
            Progress {
                state: TaskState::Created,
                started: None,
                retry_count: 0,
                last_error: None,
                holds_slot: false,
                retry_timer: None,
            },
        )
    }
}
