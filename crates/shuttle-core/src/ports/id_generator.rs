//! IdGenerator - ID 生成
//!
//! Clock を使って現在時刻ベースの ULID を生成します。
//! FixedClock を渡すと timestamp 部分が固定され、テストで順序を制御できます。

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::ids::{Id, IdMarker};
use crate::ports::Clock;

#[derive(Clone)]
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// 任意の ID 型を生成（`let id: TaskId = ids.next();`）
    pub fn next<T: IdMarker>(&self) -> Id<T> {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Id::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

impl std::fmt::Debug for UlidGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UlidGenerator").finish_non_exhaustive()
    }
}
