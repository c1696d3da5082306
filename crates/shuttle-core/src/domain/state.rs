//! State - タスクの状態
//!
//! # 状態遷移
//! - queued → working: lock 取得後、実行開始
//! - working → completed: 成功
//! - working → queued: 失敗（再配送でリトライ）
//! - queued → invalid_payload: payload 検証エラー
//! - failed: `mark_failed` でのみ到達（リトライ上限など）
//!
//! completed と invalid_payload は終端で、配送を ack して捨ててよい状態です。

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Working,
    Completed,
    Failed,
    InvalidPayload,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::InvalidPayload => "invalid_payload",
        }
    }

    /// 再配送されても実行せず ack してよい終端状態か
    pub fn is_acknowledgeable(&self) -> bool {
        matches!(self, Self::Completed | Self::InvalidPayload)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-status task counts for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub working: usize,
    pub completed: usize,
    pub failed: usize,
    pub invalid_payload: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Queued => self.queued += 1,
            TaskStatus::Working => self.working += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::InvalidPayload => self.invalid_payload += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.working + self.completed + self.failed + self.invalid_payload
    }
}

impl FromIterator<TaskStatus> for StatusCounts {
    fn from_iter<I: IntoIterator<Item = TaskStatus>>(iter: I) -> Self {
        let mut counts = Self::default();
        for status in iter {
            counts.record(status);
        }
        counts
    }
}
