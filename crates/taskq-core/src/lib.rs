//! taskq-core
//!
//! A durable, concurrent task queue: bounded worker slots, dependencies
//! between tasks, retry with exponential backoff, coalescing of pending work,
//! and persistence so pending tasks survive a restart.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task_type, priority, state, errors, record）
//! - **ports**: 抽象化レイヤー（PersistenceProvider, LogSink, Clock, IdGenerator）
//! - **queue**: Queue, Task, QueueBuilder, 依存グラフ, retry, handler traits
//! - **typed**: 型付き Task API（Payload trait, Handler trait）
//! - **impls**: ports の実装（MemoryStore, JsonFileStore, TracingLogSink）
//! - **error**: 構築・設定時のエラー型

pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod typed;

pub use crate::domain::{
    QueuePriority, ServiceClass, TaskError, TaskId, TaskRecord, TaskState, TaskType,
};
pub use crate::error::QueueError;
pub use crate::queue::{
    Admission, CoalescingHandler, Queue, QueueBuilder, QueueConfig, RetryPolicy, Task,
    TaskBuilder, TaskHandler, coalesce_fn, handler_fn,
};
