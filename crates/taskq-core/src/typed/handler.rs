//! Handler trait - 型付き payload を受け取る Handler
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<P>)
//! - Type erasure パターン (TypedHandler<P, H> → dyn TaskHandler)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::payload::Payload;
use crate::domain::TaskError;
use crate::queue::{Task, TaskHandler};

/// Handler は decode 済みの payload を処理して結果を返す
///
/// 戻り値はそのまま [`Task::completed`] に渡される。`Err` は retry 対象
/// ([`TaskError::Failed`] の場合)。
///
/// # 使用例
/// ```ignore
/// struct ResizeHandler;
///
/// #[async_trait]
/// impl Handler<Resize> for ResizeHandler {
///     async fn handle(&self, task: &Task, payload: Resize) -> Result<(), TaskError> {
///         resize(&payload.path, payload.width).map_err(|e| TaskError::failed(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<P: Payload>: Send + Sync {
    async fn handle(&self, task: &Task, payload: P) -> Result<(), TaskError>;
}

/// Adapts a [`Handler<P>`] to the untyped [`TaskHandler`] the queue stores.
pub struct TypedHandler<P: Payload, H: Handler<P>> {
    handler: H,
    _marker: PhantomData<fn() -> P>,
}

impl<P: Payload, H: Handler<P>> TypedHandler<P, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<P: Payload, H: Handler<P>> TaskHandler for TypedHandler<P, H> {
    async fn handle(&self, task: Task) {
        let result = match task.decode::<P>() {
            Ok(payload) => self.handler.handle(&task, payload).await,
            Err(e) => Err(TaskError::failed(format!("json decode: {e}"))),
        };
        task.completed(result.err());
    }
}
