//! InMemoryStateStore - 開発用・テスト用の正本
//!
//! # 実装詳細
//! - すべての行を1つの `tokio::sync::Mutex` で守る（insert 順の Vec）
//! - Lease テーブルは `TaskId → Lease` の map。期限判定は Clock で行う
//! - `find_or_create_task` は作成用のゲートを握ったまま検索・insert・callback を
//!   行う。callback は store を読んでもよい（状態ロックは握っていない）
//! - `run_in_transaction` はトランザクションを直列化するだけ（ロールバックは無い）

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::{
    Descriptor, JobId, JobRecord, Lease, LeaseToken, NewTask, Page, Payload, Result,
    ShuttleError, StatusCounts, TaskId, TaskRecord, TaskStatus, WorkflowId, WorkflowRecord,
};
use crate::ports::{Clock, OnInsert, StateStore, SystemClock, UlidGenerator};

#[derive(Default)]
struct StoreState {
    workflows: Vec<WorkflowRecord>,
    jobs: Vec<JobRecord>,
    tasks: Vec<TaskRecord>,
    leases: std::collections::HashMap<TaskId, Lease>,
}

impl StoreState {
    fn task_mut(&mut self, id: TaskId) -> Result<&mut TaskRecord> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(ShuttleError::TaskNotFound(id))
    }

    fn job_is_completed(&self, job_id: JobId) -> bool {
        let mut tasks = self.tasks.iter().filter(|t| t.job_id == job_id).peekable();
        tasks.peek().is_some() && tasks.all(|t| t.status == TaskStatus::Completed)
    }

    fn remove_job(&mut self, job_id: JobId) {
        self.jobs.retain(|j| j.id != job_id);
        let leases = &mut self.leases;
        self.tasks.retain(|t| {
            let keep = t.job_id != job_id;
            if !keep {
                leases.remove(&t.id);
            }
            keep
        });
    }
}

pub struct InMemoryStateStore {
    state: Mutex<StoreState>,
    create_gate: Mutex<()>,
    transaction_gate: Mutex<()>,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            create_gate: Mutex::new(()),
            transaction_gate: Mutex::new(()),
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
        }
    }

    /// Number of task rows (for tests and the demo CLI).
    pub async fn task_count(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    fn expiry(&self, period: Duration) -> DateTime<Utc> {
        let period = TimeDelta::from_std(period).unwrap_or(TimeDelta::MAX);
        self.clock.now() + period
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn persist_workflow(
        &self,
        name: &str,
        descriptor: &Descriptor,
    ) -> Result<WorkflowRecord> {
        let mut state = self.state.lock().await;
        if state.workflows.iter().any(|w| w.name == name) {
            return Err(ShuttleError::DuplicateWorkflow(name.to_string()));
        }
        let record = WorkflowRecord {
            id: self.ids.next(),
            name: name.to_string(),
            descriptor: descriptor.clone(),
            created_at: self.clock.now(),
        };
        state.workflows.push(record.clone());
        Ok(record)
    }

    async fn find_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>> {
        let state = self.state.lock().await;
        Ok(state.workflows.iter().find(|w| w.id == id).cloned())
    }

    async fn find_workflow_by_name(&self, name: &str) -> Result<Option<WorkflowRecord>> {
        let state = self.state.lock().await;
        Ok(state.workflows.iter().find(|w| w.name == name).cloned())
    }

    async fn select_workflows(&self, page: Page) -> Result<Vec<WorkflowRecord>> {
        Ok(page.apply(&self.state.lock().await.workflows))
    }

    async fn count_workflows(&self) -> Result<usize> {
        Ok(self.state.lock().await.workflows.len())
    }

    async fn delete_workflow(&self, id: WorkflowId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.workflows.len();
        state.workflows.retain(|w| w.id != id);
        Ok(state.workflows.len() != before)
    }

    async fn delete_workflow_by_name(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.workflows.len();
        state.workflows.retain(|w| w.name != name);
        Ok(state.workflows.len() != before)
    }

    async fn persist_job(&self, workflow: &WorkflowRecord, payload: &Payload) -> Result<JobRecord> {
        let now = self.clock.now();
        let record = JobRecord {
            id: self.ids.next(),
            workflow: workflow.clone(),
            payload: payload.clone(),
            created_at: now,
            updated_at: now,
        };
        self.state.lock().await.jobs.push(record.clone());
        Ok(record)
    }

    async fn find_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        let state = self.state.lock().await;
        Ok(state.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn select_jobs(&self, page: Page) -> Result<Vec<JobRecord>> {
        Ok(page.apply(&self.state.lock().await.jobs))
    }

    async fn count_jobs(&self) -> Result<usize> {
        Ok(self.state.lock().await.jobs.len())
    }

    async fn delete_job(&self, id: JobId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let existed = state.jobs.iter().any(|j| j.id == id);
        state.remove_job(id);
        Ok(existed)
    }

    async fn clear_completed_jobs(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let completed: Vec<JobId> = state
            .jobs
            .iter()
            .map(|j| j.id)
            .filter(|id| state.job_is_completed(*id))
            .collect();
        for id in &completed {
            state.remove_job(*id);
        }
        Ok(completed.len())
    }

    async fn find_or_create_task<'a>(
        &'a self,
        task: NewTask,
        on_insert: OnInsert<'a>,
    ) -> Result<TaskId> {
        let _gate = self.create_gate.lock().await;

        let id = {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.tasks.iter().find(|t| task.matches(t)) {
                return Ok(existing.id);
            }
            let now = self.clock.now();
            let id: TaskId = self.ids.next();
            state.tasks.push(TaskRecord {
                id,
                job_id: task.job_id,
                name: task.name,
                parent_task_id: task.parent_task_id,
                queue_name: task.queue_name,
                payload: task.payload,
                status: TaskStatus::Queued,
                attempts: 0,
                created_at: now,
                updated_at: now,
            });
            id
        };

        if let Err(e) = on_insert(id).await {
            warn!(task_id = %id, error = %e, "enqueue failed, rolling back task insert");
            self.state.lock().await.tasks.retain(|t| t.id != id);
            return Err(e);
        }
        Ok(id)
    }

    async fn find_task(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        let state = self.state.lock().await;
        Ok(state.tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn select_tasks_by_job_id(&self, job_id: JobId) -> Result<Vec<TaskRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn find_task_ids_by_job_id_and_name(
        &self,
        job_id: JobId,
        name: &str,
    ) -> Result<Vec<TaskId>> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.job_id == job_id && t.name == name)
            .map(|t| t.id)
            .collect())
    }

    async fn find_task_ids_by_job_id_name_and_parent_task_ids(
        &self,
        job_id: JobId,
        name: &str,
        parent_task_ids: &[TaskId],
    ) -> Result<Vec<TaskId>> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .iter()
            .filter(|t| {
                t.job_id == job_id
                    && t.name == name
                    && t.parent_task_id.is_some_and(|p| parent_task_ids.contains(&p))
            })
            .map(|t| t.id)
            .collect())
    }

    async fn task_status_counts(&self, job_id: JobId) -> Result<StatusCounts> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.job_id == job_id)
            .map(|t| t.status)
            .collect())
    }

    async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task = state.task_mut(id)?;
        task.status = status;
        task.updated_at = now;
        Ok(())
    }

    async fn increment_attempts(&self, id: TaskId) -> Result<u32> {
        let mut state = self.state.lock().await;
        let task = state.task_mut(id)?;
        task.attempts += 1;
        Ok(task.attempts)
    }

    async fn acquire_lease(&self, id: TaskId, period: Duration) -> Result<Option<Lease>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.leases.get(&id).is_some_and(|l| l.is_live_at(now)) {
            return Ok(None);
        }
        let lease = Lease {
            token: self.ids.next(),
            locked_until: self.expiry(period),
        };
        state.leases.insert(id, lease);
        Ok(Some(lease))
    }

    async fn release_lease(&self, id: TaskId, token: LeaseToken) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.leases.get(&id) {
            Some(lease) if lease.token == token => {
                state.leases.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn renew_lease(
        &self,
        id: TaskId,
        period: Duration,
        token: LeaseToken,
    ) -> Result<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(lease) = state.leases.get_mut(&id) else {
            return Ok(None);
        };
        if lease.token != token || !lease.is_live_at(now) {
            return Ok(None);
        }
        lease.locked_until = self.expiry(period);
        Ok(Some(lease.locked_until))
    }

    async fn run_in_transaction<'a>(&'a self, work: BoxFuture<'a, Result<()>>) -> Result<()> {
        let _gate = self.transaction_gate.lock().await;
        work.await
    }
}
