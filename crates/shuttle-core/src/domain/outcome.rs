//! Outcome: task body の結果の分類
//!
//! 失敗は `Err(ShuttleError)` で返します。`Outcome` は正常系の2通りだけです。

use serde::{Deserialize, Serialize};

/// Result of a task body that did not fail.
///
/// - `Success`: 完了。次の task を作り、completed にして ack する
/// - `Blocked`: 前提（sync 条件など）がまだ揃っていない。状態を queued に戻し、
///   ack せずに再配送を待つ。debug より上のログは出さない
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Blocked(String),
}

impl Outcome {
    pub fn success() -> Self {
        Self::Success
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self::Blocked(reason.into())
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}
