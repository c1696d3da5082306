//! Persisted records and store/queue value types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::descriptor::Descriptor;
use super::ids::{JobId, LeaseToken, MessageId, TaskId, WorkflowId};
use super::payload::Payload;
use super::state::TaskStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub name: String,
    pub descriptor: Descriptor,
    pub created_at: DateTime<Utc>,
}

/// Job row. 読み出し時に workflow をまるごと持たせる（descriptor の lookup 用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub workflow: WorkflowRecord,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub job_id: JobId,
    pub name: String,
    pub parent_task_id: Option<TaskId>,
    pub queue_name: String,
    pub payload: Payload,
    pub status: TaskStatus,
    /// 実行を開始した回数（リトライ上限の判定用）
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The dedup tuple: two tasks with equal `NewTask`s are the same task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub job_id: JobId,
    pub name: String,
    pub parent_task_id: Option<TaskId>,
    pub queue_name: String,
    pub payload: Payload,
}

impl NewTask {
    pub fn matches(&self, record: &TaskRecord) -> bool {
        self.job_id == record.job_id
            && self.name == record.name
            && self.parent_task_id == record.parent_task_id
            && self.queue_name == record.queue_name
            && self.payload == record.payload
    }
}

/// A live lease held in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub token: LeaseToken,
    pub locked_until: DateTime<Utc>,
}

impl Lease {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until > now
    }
}

/// One queue delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: MessageId,
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Pagination for `select` queries, ordered by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
    pub order: SortOrder,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 30,
            offset: 0,
            order: SortOrder::Asc,
        }
    }
}

impl Page {
    /// Applies the page to rows already sorted oldest first.
    pub fn apply<T: Clone>(&self, rows: &[T]) -> Vec<T> {
        let iter: Box<dyn Iterator<Item = &T>> = match self.order {
            SortOrder::Asc => Box::new(rows.iter()),
            SortOrder::Desc => Box::new(rows.iter().rev()),
        };
        iter.skip(self.offset).take(self.limit).cloned().collect()
    }
}
