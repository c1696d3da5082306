//! Worker lifecycle hooks.
//!
//! 1 イテレーション = `before` → `around(取得と処理)` → `after`。
//! 何もしない実装がデフォルトなので、必要なものだけ上書きします。

use async_trait::async_trait;
use futures::future::BoxFuture;

#[async_trait]
pub trait WorkerHooks: Send + Sync {
    async fn before(&self, _queue_name: &str) {}

    /// Wraps one fetch-and-process iteration. Implementations must await `iteration`.
    async fn around<'a>(&'a self, _queue_name: &'a str, iteration: BoxFuture<'a, ()>) {
        iteration.await
    }

    async fn after(&self, _queue_name: &str) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl WorkerHooks for NoHooks {}
