//! StateStore port - workflow/job/task の正本（source of truth）
//!
//! # 設計原則
//! - task の作成と enqueue は一体: `find_or_create_task` は初回 insert のときだけ
//!   `on_insert` を呼び、それが失敗したら insert も取り消す
//! - Lease テーブルが worker 間の唯一の排他点。CAS で操作する
//!   （期限切れか未取得なら acquire、token 一致なら release、
//!   token 一致かつ期限内なら renew）
//! - `run_in_transaction` は「次の task を作る → unlock → completed」を
//!   ひとまとまりにするための境界

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::domain::{
    Descriptor, JobId, JobRecord, Lease, LeaseToken, NewTask, Page, Payload, Result,
    StatusCounts, TaskId, TaskRecord, TaskStatus, WorkflowId, WorkflowRecord,
};

/// Callback run once, right after a task row is first inserted.
pub type OnInsert<'a> = Box<dyn FnOnce(TaskId) -> BoxFuture<'a, Result<()>> + Send + 'a>;

#[async_trait]
pub trait StateStore: Send + Sync {
    // workflows

    /// 同名の workflow があれば `DuplicateWorkflow`
    async fn persist_workflow(&self, name: &str, descriptor: &Descriptor)
        -> Result<WorkflowRecord>;
    async fn find_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>>;
    async fn find_workflow_by_name(&self, name: &str) -> Result<Option<WorkflowRecord>>;
    async fn select_workflows(&self, page: Page) -> Result<Vec<WorkflowRecord>>;
    async fn count_workflows(&self) -> Result<usize>;
    async fn delete_workflow(&self, id: WorkflowId) -> Result<bool>;
    async fn delete_workflow_by_name(&self, name: &str) -> Result<bool>;

    // jobs

    async fn persist_job(&self, workflow: &WorkflowRecord, payload: &Payload) -> Result<JobRecord>;
    async fn find_job(&self, id: JobId) -> Result<Option<JobRecord>>;
    async fn select_jobs(&self, page: Page) -> Result<Vec<JobRecord>>;
    async fn count_jobs(&self) -> Result<usize>;
    /// job とその task を削除
    async fn delete_job(&self, id: JobId) -> Result<bool>;
    /// すべての task が completed の job を削除し、削除した数を返す
    async fn clear_completed_jobs(&self) -> Result<usize>;

    // tasks

    /// Returns the id of the task matching the dedup tuple, inserting it
    /// (and running `on_insert`) when it does not exist yet.
    async fn find_or_create_task<'a>(&'a self, task: NewTask, on_insert: OnInsert<'a>)
        -> Result<TaskId>;
    async fn find_task(&self, id: TaskId) -> Result<Option<TaskRecord>>;
    async fn select_tasks_by_job_id(&self, job_id: JobId) -> Result<Vec<TaskRecord>>;
    async fn find_task_ids_by_job_id_and_name(&self, job_id: JobId, name: &str)
        -> Result<Vec<TaskId>>;
    async fn find_task_ids_by_job_id_name_and_parent_task_ids(
        &self,
        job_id: JobId,
        name: &str,
        parent_task_ids: &[TaskId],
    ) -> Result<Vec<TaskId>>;
    async fn task_status_counts(&self, job_id: JobId) -> Result<StatusCounts>;
    /// 無条件の書き込み。task が無ければ `TaskNotFound`
    async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<()>;
    /// 実行回数を1増やし、増やした後の値を返す
    async fn increment_attempts(&self, id: TaskId) -> Result<u32>;

    // leases

    /// 取れなければ `Ok(None)`（エラーではない）
    async fn acquire_lease(&self, id: TaskId, period: Duration) -> Result<Option<Lease>>;
    async fn release_lease(&self, id: TaskId, token: LeaseToken) -> Result<bool>;
    async fn renew_lease(
        &self,
        id: TaskId,
        period: Duration,
        token: LeaseToken,
    ) -> Result<Option<DateTime<Utc>>>;

    async fn run_in_transaction<'a>(&'a self, work: BoxFuture<'a, Result<()>>) -> Result<()>;
}
