//! TaskHandler - worker が実行する task body
//!
//! Handler は `Task` を借りて `Outcome` を返します。失敗は `Err` で返すと
//! worker が再配送の経路に乗せます。

use async_trait::async_trait;

use super::task::Task;
use crate::domain::{Outcome, Result};

/// # 使用例
/// ```ignore
/// struct Print;
///
/// #[async_trait]
/// impl TaskHandler for Print {
///     async fn handle(&self, task: &Task) -> Result<Outcome> {
///         println!("{:?}", task.payload());
///         Ok(Outcome::success())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<Outcome>;
}

/// Completes every task without doing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

#[async_trait]
impl TaskHandler for NoopHandler {
    async fn handle(&self, _task: &Task) -> Result<Outcome> {
        Ok(Outcome::success())
    }
}

#[async_trait]
impl<H: TaskHandler + ?Sized> TaskHandler for std::sync::Arc<H> {
    async fn handle(&self, task: &Task) -> Result<Outcome> {
        (**self).handle(task).await
    }
}
