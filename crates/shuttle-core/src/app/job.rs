//! Job - workflow を payload に束ねたもの
//!
//! Job は task の一覧を持ちません。task が job_id で job を参照します。
//! ここにあるのは「完了した task の次に何を作るか」を決めるグラフ走査です。
//!
//! # 次の task の決め方
//! - `starts`: 同じ payload をそのまま渡す
//! - `starts_with_params`: param を計算して payload に差し込んでから渡す
//!   （`count` = 親 task の系譜の下にある source 型の task 数）
//! - `starts_parallel` / `starts_manually`: ここでは作らない（SplitWorker が作る）
//!
//! どの経路でも、task を作る直前に payload を task type ごとに絞り込みます
//! （[`payload::scope_for_task`]）。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use super::builder::Context;
use super::task::Task;
use super::workflow::{Workflow, WorkflowRef};
use crate::domain::payload;
use crate::domain::{
    Descriptor, JobId, JobRecord, NewTask, Page, ParamSource, Payload, Result, ShuttleError,
    StatusCounts, SyncCondition, TaskId, TaskSpec,
};

#[derive(Clone)]
pub struct Job {
    ctx: Context,
    record: JobRecord,
}

/// Plain and parametrized successors of one task type.
#[derive(Debug, Clone, Copy)]
pub struct NextTasks<'a> {
    pub without_params: &'a [String],
    pub with_params: &'a BTreeMap<String, BTreeMap<String, ParamSource>>,
}

impl Job {
    pub async fn create(
        ctx: &Context,
        workflow: impl Into<WorkflowRef>,
        payload: Payload,
    ) -> Result<Self> {
        let workflow = Workflow::resolve(ctx, workflow.into()).await?;
        let record = ctx.store().persist_job(workflow.record(), &payload).await?;
        debug!(job = %record.id, workflow = workflow.name(), "job created");
        Ok(Self::from_record(ctx, record))
    }

    pub async fn find(ctx: &Context, id: JobId) -> Result<Self> {
        ctx.store()
            .find_job(id)
            .await?
            .map(|record| Self::from_record(ctx, record))
            .ok_or(ShuttleError::JobNotFound(id))
    }

    pub async fn select(ctx: &Context, page: Page) -> Result<Vec<Self>> {
        let records = ctx.store().select_jobs(page).await?;
        Ok(records
            .into_iter()
            .map(|record| Self::from_record(ctx, record))
            .collect())
    }

    pub async fn count(ctx: &Context) -> Result<usize> {
        ctx.store().count_jobs().await
    }

    pub async fn delete(ctx: &Context, id: JobId) -> Result<bool> {
        ctx.store().delete_job(id).await
    }

    /// Deletes every job whose tasks are all completed.
    pub async fn clear_completed(ctx: &Context) -> Result<usize> {
        ctx.store().clear_completed_jobs().await
    }

    fn from_record(ctx: &Context, record: JobRecord) -> Self {
        Self {
            ctx: ctx.clone(),
            record,
        }
    }

    pub fn id(&self) -> JobId {
        self.record.id
    }

    pub fn payload(&self) -> &Payload {
        &self.record.payload
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.record.workflow.descriptor
    }

    pub fn workflow(&self) -> Workflow {
        Workflow::from_record(self.record.workflow.clone())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.record.updated_at
    }

    /// Creates the root task of every entry point.
    pub async fn start(&self) -> Result<Vec<TaskId>> {
        let mut created = Vec::new();
        for name in &self.descriptor().starts {
            created.push(self.create_task(None, name, self.payload()).await?);
        }
        debug!(job = %self.id(), tasks = created.len(), "job started");
        Ok(created)
    }

    pub fn task_spec(&self, task_type: &str) -> Result<&TaskSpec> {
        self.descriptor().task(task_type).ok_or_else(|| {
            ShuttleError::InvalidTaskAttributes(format!("unknown task type {task_type:?}"))
        })
    }

    pub fn queue_name(&self, task_type: &str) -> Result<&str> {
        Ok(&self.task_spec(task_type)?.queue)
    }

    pub fn next_task_names(&self, task_type: &str) -> Result<NextTasks<'_>> {
        let spec = self.task_spec(task_type)?;
        Ok(NextTasks {
            without_params: &spec.starts,
            with_params: &spec.starts_with_params,
        })
    }

    pub fn tasks_to_wait_for(&self, task: &Task) -> Vec<&str> {
        self.descriptor()
            .task(task.name())
            .map(|spec| spec.waits_for.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn sync_condition(&self, task: &Task, waited_task_type: &str) -> Option<&SyncCondition> {
        self.descriptor()
            .task(task.name())?
            .waits_for
            .get(waited_task_type)
            .map(|wait| &wait.condition)
    }

    /// Creates (or finds) a task of `task_type` with `payload` scoped to that type.
    pub async fn create_task(
        &self,
        parent_task_id: Option<TaskId>,
        task_type: &str,
        payload: &Payload,
    ) -> Result<TaskId> {
        let queue_name = self.queue_name(task_type)?.to_string();
        let attributes = NewTask {
            job_id: self.id(),
            name: task_type.to_string(),
            parent_task_id,
            queue_name,
            payload: payload::scope_for_task(self.descriptor(), payload, task_type),
        };
        Task::create(&self.ctx, attributes).await
    }

    pub async fn create_next_tasks(&self, parent: &Task, payload: &Payload) -> Result<Vec<TaskId>> {
        let next = self.next_task_names(parent.name())?;
        let mut created = Vec::new();

        for name in next.without_params {
            created.push(self.create_task(Some(parent.id()), name, payload).await?);
        }

        for (name, params) in next.with_params {
            let mut updated = payload.clone();
            for (param_name, source) in params {
                let value = self.compute_param(parent.id(), source).await?;
                updated.insert(param_name.clone(), value);
            }
            created.push(self.create_task(Some(parent.id()), name, &updated).await?);
        }

        debug!(task_id = %parent.id(), created = created.len(), "next tasks created");
        Ok(created)
    }

    async fn compute_param(&self, parent_id: TaskId, source: &ParamSource) -> Result<Value> {
        match source {
            ParamSource::Count(task_type) => {
                let ids = self
                    .find_task_ids_by_name_and_ancestor_task_id(task_type, Some(parent_id))
                    .await?;
                Ok(Value::from(ids.len()))
            }
        }
    }

    pub async fn find_task_ids_by_name(&self, task_type: &str) -> Result<Vec<TaskId>> {
        self.ctx
            .store()
            .find_task_ids_by_job_id_and_name(self.id(), task_type)
            .await
    }

    /// Ids of `task_type` tasks that descend from `ancestor_task_id`.
    ///
    /// descriptor 上の一意な経路（祖先の型 → `task_type`）を上から辿り、各段で
    /// `parent_task_id ∈ 前段の id` の task に絞り込む。同じ job の別の起動で
    /// 作られた同型の task は含まれない。
    ///
    /// `ancestor_task_id` が `None`（ルート task）のときは job 全体から探す。
    pub async fn find_task_ids_by_name_and_ancestor_task_id(
        &self,
        task_type: &str,
        ancestor_task_id: Option<TaskId>,
    ) -> Result<Vec<TaskId>> {
        let Some(ancestor_id) = ancestor_task_id else {
            return self.find_task_ids_by_name(task_type).await;
        };
        let ancestor = self
            .ctx
            .store()
            .find_task(ancestor_id)
            .await?
            .ok_or(ShuttleError::TaskNotFound(ancestor_id))?;

        let Some(path) = self.descriptor().path_from_ancestor(&ancestor.name, task_type) else {
            warn!(
                job = %self.id(),
                ancestor = %ancestor.name,
                task_type,
                "task type does not descend from ancestor"
            );
            return Ok(Vec::new());
        };

        let mut ids = vec![ancestor_id];
        for step in &path {
            if ids.is_empty() {
                break;
            }
            ids = self
                .ctx
                .store()
                .find_task_ids_by_job_id_name_and_parent_task_ids(self.id(), step, &ids)
                .await?;
        }
        Ok(ids)
    }

    pub async fn task_status_counts(&self) -> Result<StatusCounts> {
        self.ctx.store().task_status_counts(self.id()).await
    }

    /// Status counts over a given set of tasks, read live from the store.
    pub async fn status_counts_of(&self, ids: &[TaskId]) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for &id in ids {
            let record = self
                .ctx
                .store()
                .find_task(id)
                .await?
                .ok_or(ShuttleError::TaskNotFound(id))?;
            counts.record(record.status);
        }
        Ok(counts)
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("record", &self.record).finish()
    }
}
