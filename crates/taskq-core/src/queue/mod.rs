//! Queue module: admission, dependency-aware dispatch, coalescing, retry
//! scheduling, and persistence orchestration.
//!
//! Design intent:
//! - All scheduler state sits behind one mutex ([`state::QueueState`]); the
//!   lock is never held across an `.await` or while caller code runs (handlers,
//!   coalescers, completion callback).
//! - Persistence calls happen under the lock so the stored set stays an exact
//!   mirror of the live index.
//! - Worker slots are counted, not threads: a task holds a slot from dispatch
//!   until it completes, is cancelled, or goes into backoff. Handlers may
//!   report completion later from any thread.

mod builder;
mod config;
mod dependency;
mod handler;
mod retry;
mod state;
mod task;

pub use builder::QueueBuilder;
pub use config::QueueConfig;
pub use dependency::DependencyGraph;
pub use handler::{
    CoalescingHandler, CompletionCallback, FnCoalescer, FnHandler, TaskHandler, coalesce_fn,
    handler_fn,
};
pub use retry::{MAX_RETRY_DELAY, MIN_RETRY_DELAY, RetryPolicy};
pub use task::{Task, TaskBuilder};

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;

use self::state::QueueState;
use crate::domain::{TaskError, TaskId, TaskType};
use crate::error::QueueError;
use crate::ports::{Clock, LogLevel, LogSink, PersistenceProvider};

/// Result of [`Queue::add_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The task (or the replacement produced by coalescing) is live.
    Admitted(TaskId),
    /// Duplicate ID, already finished, or bound to another queue. Logged.
    Rejected(TaskId),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    pub fn task_id(&self) -> &TaskId {
        match self {
            Admission::Admitted(id) | Admission::Rejected(id) => id,
        }
    }
}

/// Handle to a named queue. Clones share the same queue.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

pub(crate) struct QueueInner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    persistence: Option<Arc<dyn PersistenceProvider>>,
    log_sink: Arc<dyn LogSink>,
    clock: Arc<dyn Clock>,
    on_complete: Option<CompletionCallback>,
    runtime: Handle,
}

impl Queue {
    pub fn builder(config: QueueConfig) -> QueueBuilder {
        QueueBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.config.max_concurrency
    }

    pub fn max_retries(&self) -> u32 {
        self.inner.config.max_retries
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.config.retry
    }

    /// Submit a task.
    ///
    /// 1. coalesce with idle same-type tasks if a coalescer is registered
    /// 2. reject duplicates (logged, no state change)
    /// 3. register and persist
    /// 4. wire dependencies on live tasks (unknown IDs are dropped)
    /// 5. dispatch when eligible
    pub fn add_task(&self, task: Task) -> Admission {
        let mut retired = Vec::new();
        let admission = {
            let mut state = self.lock();
            let (task, replaced) = self.coalesce_locked(&mut state, task, &mut retired);
            if replaced && state.is_registered(&task) {
                // the coalescer kept one of the live tasks
                Admission::Admitted(task.id().clone())
            } else if self.admit_locked(&mut state, &task, true) {
                let deps: Vec<Task> = task
                    .dependencies()
                    .iter()
                    .filter_map(|dep_id| match state.live.get(dep_id) {
                        Some(dep) => Some(dep.clone()),
                        None => {
                            self.log(
                                LogLevel::Warning,
                                &format!("Discarding missing dependency {dep_id} from {}", task.id()),
                            );
                            None
                        }
                    })
                    .collect();
                self.link_locked(&mut state, &task, deps);
                Admission::Admitted(task.id().clone())
            } else {
                Admission::Rejected(task.id().clone())
            }
        };

        for task in &retired {
            self.notify_terminal(task);
        }
        if admission.is_admitted() || !retired.is_empty() {
            self.pump();
        }
        admission
    }

    /// Restore every task persisted under this queue's name.
    ///
    /// Dependencies resolve within the restored batch only. Tasks are already
    /// durable, so they are neither coalesced nor saved again. Returns how many
    /// tasks were admitted.
    pub fn load_persisted_tasks(&self) -> Result<usize, QueueError> {
        let Some(persistence) = self.inner.persistence.as_ref() else {
            return Ok(0);
        };
        let batch: Vec<Task> = persistence
            .load_all(self.name())?
            .iter()
            .filter_map(|raw| Task::deserialize(raw, self))
            .collect();

        let admitted = {
            let mut state = self.lock();
            let admitted: Vec<Task> = batch
                .iter()
                .filter(|task| self.admit_locked(&mut state, task, false))
                .cloned()
                .collect();
            let admitted_ids: HashSet<&TaskId> = admitted.iter().map(Task::id).collect();
            for task in &admitted {
                let deps: Vec<Task> = task
                    .setup_dependencies(&batch)
                    .into_iter()
                    .filter(|dep| admitted_ids.contains(dep.id()))
                    .collect();
                self.link_locked(&mut state, task, deps);
            }
            admitted.len()
        };

        self.log(
            LogLevel::Info,
            &format!("Restored {admitted} task(s) into queue {}", self.name()),
        );
        self.pump();
        Ok(admitted)
    }

    /// Live task by ID; `None` once it is terminal.
    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.lock().live.get(task_id).cloned()
    }

    /// Cancel a live task by ID. False if it is not live.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.get_task(task_id) {
            Some(task) => task.cancel_with(TaskError::Cancelled),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().live.is_empty()
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.lock().live.keys().cloned().collect()
    }

    pub fn add_task_handler(
        &self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), QueueError> {
        let task_type = task_type.into();
        let mut state = self.lock();
        if state.handlers.contains_key(&task_type) {
            return Err(QueueError::DuplicateHandler(task_type));
        }
        state.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn add_coalescing_handler(
        &self,
        task_type: impl Into<TaskType>,
        coalescer: Arc<dyn CoalescingHandler>,
    ) -> Result<(), QueueError> {
        let task_type = task_type.into();
        let mut state = self.lock();
        if state.coalescers.contains_key(&task_type) {
            return Err(QueueError::DuplicateCoalescer(task_type));
        }
        state.coalescers.insert(task_type, coalescer);
        Ok(())
    }

    /// Run an eligible task: look up its handler and invoke it. A task type
    /// without a handler is cancelled with [`TaskError::NoHandler`], no retry.
    pub(crate) async fn run_task(&self, task: Task) {
        if !task.is_executing() {
            return;
        }
        let handler = self.lock().handlers.get(task.task_type()).cloned();
        let Some(handler) = handler else {
            self.log(
                LogLevel::Warning,
                &format!("No handler registered for task {}", task.id()),
            );
            task.cancel_with(TaskError::NoHandler {
                task_type: task.task_type().clone(),
            });
            return;
        };

        self.log(
            LogLevel::Debug,
            &format!("Starting task {} (attempt {})", task.id(), task.retry_count() + 1),
        );
        let running = task.clone();
        let join = self
            .inner
            .runtime
            .spawn(async move { handler.handle(running).await });
        if let Err(err) = join.await
            && err.is_panic()
        {
            self.log(
                LogLevel::Error,
                &format!("Handler for task {} panicked", task.id()),
            );
            task.completed(Some(TaskError::failed("handler panicked")));
        }
    }

    pub(crate) fn log(&self, level: LogLevel, message: &str) {
        self.inner.log_sink.log(level, message);
    }

    pub(crate) fn downgrade(&self) -> Weak<QueueInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<QueueInner>) -> Option<Queue> {
        weak.upgrade().map(|inner| Queue { inner })
    }

    /// Terminal-state hook: drop from the live index and the store, release
    /// the slot, unblock dependents, notify the caller.
    pub(crate) fn on_terminal(&self, task: &Task) {
        let retired = {
            let mut state = self.lock();
            self.retire_locked(&mut state, task)
        };
        if retired {
            self.notify_terminal(task);
            self.pump();
        }
    }

    /// Bookkeeping half of the terminal hook. False if `task` is not the
    /// registered instance (already retired, or never admitted).
    fn retire_locked(&self, state: &mut QueueState, task: &Task) -> bool {
        if !state.is_registered(task) {
            return false;
        }
        state.live.remove(task.id());
        if task.take_slot() {
            state.running -= 1;
        }
        for unblocked in state.graph.remove_task(task.id()) {
            if let Some(dependent) = state.live.get(&unblocked).cloned()
                && dependent.mark_ready()
            {
                state.push_ready(dependent);
            }
        }
        if let Some(persistence) = &self.inner.persistence
            && let Err(e) = persistence.remove(task.id(), self.name())
        {
            self.log(
                LogLevel::Error,
                &format!("Failed to remove persisted task {}: {e}", task.id()),
            );
        }
        true
    }

    /// Caller-facing half of the terminal hook; runs without the state lock.
    fn notify_terminal(&self, task: &Task) {
        let last_error = task.last_error();
        match &last_error {
            None => self.log(LogLevel::Info, &format!("Task {} finished", task.id())),
            Some(err) => self.log(
                LogLevel::Info,
                &format!("Task {} cancelled: {err}", task.id()),
            ),
        }
        if let Some(on_complete) = &self.inner.on_complete {
            on_complete(last_error.as_ref(), task);
        }
    }

    /// Release the slot, refresh the stored record, and re-dispatch after the
    /// backoff delay without occupying a worker.
    pub(crate) fn schedule_retry(&self, task: &Task, retry_count: u32) {
        let delay = self.inner.config.retry.delay_for(retry_count);
        {
            let mut state = self.lock();
            if task.take_slot() {
                state.running -= 1;
            }
            if state.is_registered(task) {
                self.persist_locked(task);
            }
        }

        let reason = task
            .last_error()
            .map(|e| e.to_string())
            .unwrap_or_default();
        self.log(
            LogLevel::Info,
            &format!(
                "Task {} failed (attempt {retry_count}/{}), retrying in {delay:?}: {reason}",
                task.id(),
                self.max_retries()
            ),
        );

        let weak = self.downgrade();
        let waiting = task.clone();
        let timer = self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = Queue::upgrade(&weak) {
                queue.requeue(&waiting);
            }
        });
        task.set_retry_timer(timer.abort_handle());

        self.pump();
    }

    fn requeue(&self, task: &Task) {
        let requeued = {
            let mut state = self.lock();
            if state.is_registered(task) && task.mark_ready() {
                state.push_ready(task.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.pump();
        }
    }

    /// Start as many ready tasks as there are free slots.
    fn pump(&self) {
        let now = self.now();
        let to_run = {
            let mut state = self.lock();
            let mut to_run = Vec::new();
            while state.running < self.inner.config.max_concurrency {
                let Some(task) = state.pop_ready() else {
                    break;
                };
                if task.start(now) {
                    state.running += 1;
                    to_run.push(task);
                }
            }
            to_run
        };

        for task in to_run {
            let queue = self.clone();
            self.inner.runtime.spawn(async move {
                queue.run_task(task).await;
            });
        }
    }

    /// Replace `task` with the coalesced result when a coalescer is registered
    /// and idle same-type tasks exist.
    ///
    /// Runs entirely under the state lock: the scan, the coalescer call, and
    /// the retirement of every input other than the replacement. No candidate
    /// can be dispatched and no concurrent submission can see the same idle
    /// set in between. Retired originals are pushed to `retired` for
    /// notification once the lock is released. Returns whether a coalescer
    /// produced the task.
    fn coalesce_locked(
        &self,
        state: &mut QueueState,
        task: Task,
        retired: &mut Vec<Task>,
    ) -> (Task, bool) {
        let Some(coalescer) = state.coalescers.get(task.task_type()).cloned() else {
            return (task, false);
        };
        if state.live.contains_key(task.id()) {
            return (task, false);
        }
        let mut inputs = state.coalescing_candidates(task.task_type());
        if inputs.is_empty() {
            return (task, false);
        }

        inputs.push(task);
        let replacement = coalescer.coalesce(&inputs);
        self.log(
            LogLevel::Debug,
            &format!(
                "Coalesced {} task(s) of type {} into {}",
                inputs.len(),
                replacement.task_type(),
                replacement.id()
            ),
        );

        let error = TaskError::Coalesced {
            into: replacement.id().clone(),
        };
        for input in inputs.iter().filter(|t| !t.ptr_eq(&replacement)) {
            if input.mark_cancelled(error.clone()) && self.retire_locked(state, input) {
                retired.push(input.clone());
            }
        }
        (replacement, true)
    }

    /// Register `task` in the live index (and the store if `persist`).
    fn admit_locked(&self, state: &mut QueueState, task: &Task, persist: bool) -> bool {
        if task.is_finished() {
            self.log(
                LogLevel::Warning,
                &format!("Attempted to add finished task {}", task.id()),
            );
            return false;
        }
        if state.live.contains_key(task.id()) {
            self.log(
                LogLevel::Warning,
                &format!("Attempted to add duplicate task {}", task.id()),
            );
            return false;
        }
        if !task.attach(self) {
            self.log(
                LogLevel::Warning,
                &format!("Task {} belongs to another queue", task.id()),
            );
            return false;
        }

        state.live.insert(task.id().clone(), task.clone());
        if persist {
            self.persist_locked(task);
        }
        true
    }

    /// Add ordering edges to `deps` and enqueue the task if nothing blocks it.
    fn link_locked(&self, state: &mut QueueState, task: &Task, deps: Vec<Task>) {
        for dep in deps {
            if !state.is_registered(&dep) || dep.is_finished() {
                continue;
            }
            if state.graph.would_create_cycle(task.id(), dep.id()) {
                self.log(
                    LogLevel::Warning,
                    &format!("Dropping cyclic dependency {} from {}", dep.id(), task.id()),
                );
                continue;
            }
            state.graph.add_dependency(task.id().clone(), dep.id().clone());
        }

        if !state.graph.has_dependencies(task.id()) && task.mark_ready() {
            state.push_ready(task.clone());
        }
    }

    fn persist_locked(&self, task: &Task) {
        if let Some(persistence) = &self.inner.persistence
            && let Err(e) = persistence.save(task, self.name())
        {
            self.log(
                LogLevel::Error,
                &format!("Failed to persist task {} in queue {}: {e}", task.id(), self.name()),
            );
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.config.name)
            .field("max_concurrency", &self.inner.config.max_concurrency)
            .field("max_retries", &self.inner.config.max_retries)
            .finish()
    }
}
