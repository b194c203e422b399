//! QueueBuilder - wiring of a queue and its collaborators.
//!
//! Registration errors surface at build time, not on the first dispatch:
//! duplicate handlers are rejected as they are added, and `expect_task_types`
//! makes `build` fail when an expected type has no handler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;

use super::handler::{CoalescingHandler, CompletionCallback, TaskHandler};
use super::state::QueueState;
use super::{Queue, QueueConfig, QueueInner, Task};
use crate::domain::{TaskError, TaskType};
use crate::error::QueueError;
use crate::impls::TracingLogSink;
use crate::ports::{Clock, LogSink, PersistenceProvider, SystemClock};
use crate::typed::{Handler, Payload, TypedHandler};

/// # 使用例
/// ```ignore
/// let queue = Queue::builder(QueueConfig::new("uploads").with_max_concurrency(4))
///     .persistence(Arc::new(JsonFileStore::new("/var/lib/app/queues")))
///     .handler("upload", Arc::new(UploadHandler))?
///     .on_complete(|err, task| println!("{} done: {err:?}", task.id()))
///     .expect_task_types(&["upload"])
///     .build()?;
/// queue.load_persisted_tasks()?;
/// ```
pub struct QueueBuilder {
    config: QueueConfig,
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
    coalescers: HashMap<TaskType, Arc<dyn CoalescingHandler>>,
    persistence: Option<Arc<dyn PersistenceProvider>>,
    log_sink: Option<Arc<dyn LogSink>>,
    clock: Arc<dyn Clock>,
    on_complete: Option<CompletionCallback>,
    expected_task_types: Option<Vec<String>>,
}

impl QueueBuilder {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            handlers: HashMap::new(),
            coalescers: HashMap::new(),
            persistence: None,
            log_sink: None,
            clock: Arc::new(SystemClock),
            on_complete: None,
            expected_task_types: None,
        }
    }

    /// Defaults to a [`TracingLogSink`] tagged with the queue name.
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Without a provider the queue runs purely in memory.
    pub fn persistence(mut self, provider: Arc<dyn PersistenceProvider>) -> Self {
        self.persistence = Some(provider);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<&TaskError>, &Task) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn handler(
        mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, QueueError> {
        let task_type = task_type.into();
        if self.handlers.contains_key(&task_type) {
            return Err(QueueError::DuplicateHandler(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(self)
    }

    pub fn coalescer(
        mut self,
        task_type: impl Into<TaskType>,
        coalescer: Arc<dyn CoalescingHandler>,
    ) -> Result<Self, QueueError> {
        let task_type = task_type.into();
        if self.coalescers.contains_key(&task_type) {
            return Err(QueueError::DuplicateCoalescer(task_type));
        }
        self.coalescers.insert(task_type, coalescer);
        Ok(self)
    }

    /// Register a typed handler under `P::TYPE`.
    ///
    /// # Example
    /// ```ignore
    /// builder.register::<Resize, _>(ResizeHandler)?;
    /// ```
    pub fn register<P: Payload, H: Handler<P> + 'static>(
        self,
        handler: H,
    ) -> Result<Self, QueueError> {
        self.handler(P::TYPE, Arc::new(TypedHandler::<P, H>::new(handler)))
    }

    /// Task types that must have a handler when `build` is called.
    pub fn expect_task_types(mut self, task_types: &[&str]) -> Self {
        self.expected_task_types = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// Validate and start the queue on the current tokio runtime.
    pub fn build(self) -> Result<Queue, QueueError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_task_types {
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| !self.handlers.contains_key(t.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(QueueError::MissingHandlers(missing));
            }
        }

        let runtime = Handle::try_current().map_err(|_| QueueError::NoRuntime)?;
        let log_sink = self
            .log_sink
            .unwrap_or_else(|| Arc::new(TracingLogSink::new(self.config.name.clone())));

        Ok(Queue {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::new(self.handlers, self.coalescers)),
                config: self.config,
                persistence: self.persistence,
                log_sink,
                clock: self.clock,
                on_complete: self.on_complete,
                runtime,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::handler_fn;

    fn noop() -> Arc<dyn TaskHandler> {
        handler_fn(|task: Task| task.completed(None))
    }

    #[tokio::test]
    async fn build_success() {
        let queue = QueueBuilder::new(QueueConfig::new("q"))
            .handler("a", noop())
            .unwrap()
            .expect_task_types(&["a"])
            .build()
            .unwrap();
        assert_eq!(queue.name(), "q");
        assert_eq!(queue.max_concurrency(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn build_reports_missing_task_types() {
        let result = QueueBuilder::new(QueueConfig::new("q"))
            .handler("a", noop())
            .unwrap()
            .expect_task_types(&["a", "b"])
            .build();
        assert!(matches!(
            result,
            Err(QueueError::MissingHandlers(missing)) if missing == vec!["b".to_string()]
        ));
    }

    #[test]
    fn duplicate_handler_is_rejected() {
        let result = QueueBuilder::new(QueueConfig::new("q"))
            .handler("a", noop())
            .unwrap()
            .handler("a", noop());
        assert!(matches!(result, Err(QueueError::DuplicateHandler(t)) if t.as_str() == "a"));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let result = QueueBuilder::new(QueueConfig::new("q").with_max_concurrency(0)).build();
        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
    }

    #[test]
    fn build_outside_runtime_fails() {
        let result = QueueBuilder::new(QueueConfig::new("q")).build();
        assert!(matches!(result, Err(QueueError::NoRuntime)));
    }
}
