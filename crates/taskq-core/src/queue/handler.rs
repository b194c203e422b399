//! Caller-supplied behaviour: task handlers, coalescing handlers, and the
//! global completion callback.

use std::sync::Arc;

use async_trait::async_trait;

use super::Task;
use crate::domain::TaskError;

/// Performs the work of one task type.
///
/// `handle` may return as soon as the work has been started; the handler must
/// eventually call [`Task::completed`] exactly once per dispatch (retries
/// dispatch again), from any thread.
///
/// # 使用例
/// ```ignore
/// struct Upload;
///
/// #[async_trait]
/// impl TaskHandler for Upload {
///     async fn handle(&self, task: Task) {
///         tokio::spawn(async move {
///             let result = do_upload(task.payload()).await;
///             task.completed(result.err());
///         });
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task);
}

/// Reduces several pending tasks of one type into a single replacement.
///
/// Receives the idle same-type tasks plus the incoming one (never empty).
/// The queue cancels every input that is not returned as the replacement.
///
/// Called with the queue's state lock held, so it must not call back into
/// the queue (`add_task`, `cancel`, `Task::completed`, ...). Keep it a pure
/// function of its inputs.
pub trait CoalescingHandler: Send + Sync {
    fn coalesce(&self, tasks: &[Task]) -> Task;
}

/// Called once per task when it reaches a terminal state, with its
/// `last_error` (absent on success).
pub type CompletionCallback = Arc<dyn Fn(Option<&TaskError>, &Task) + Send + Sync>;

/// Closure adapter for [`TaskHandler`], see [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap a closure that starts the work and arranges for `completed` to be
/// called.
pub fn handler_fn<F>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(Task) + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(Task) + Send + Sync,
{
    async fn handle(&self, task: Task) {
        (self.0)(task)
    }
}

/// Closure adapter for [`CoalescingHandler`], see [`coalesce_fn`].
pub struct FnCoalescer<F>(F);

pub fn coalesce_fn<F>(f: F) -> Arc<FnCoalescer<F>>
where
    F: Fn(&[Task]) -> Task + Send + Sync + 'static,
{
    Arc::new(FnCoalescer(f))
}

impl<F> CoalescingHandler for FnCoalescer<F>
where
    F: Fn(&[Task]) -> Task + Send + Sync,
{
    fn coalesce(&self, tasks: &[Task]) -> Task {
        (self.0)(tasks)
    }
}
