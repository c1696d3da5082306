//! Task - 1単位の仕事と、その lease ロック
//!
//! # 状態遷移
//! `queued → working → completed`、失敗時は `working → queued`（再配送でリトライ）、
//! 検証エラーは `invalid_payload`。`failed` は `mark_failed` でのみ到達します。
//!
//! # Lease
//! - `lock()` は store から lease を取る。競合なら `Ok(false)`（エラーではない）
//! - 取れたら更新タスクを spawn する。期間の 80% が過ぎた時点で renew し、
//!   成功したら次の期限に向けて再度待つ
//! - 更新タスクは `CancellationToken` の `DropGuard` でロック状態に紐づく。
//!   `unlock()` でも `Task` の drop でも確実に止まる
//! - 更新に失敗したら warn を出して止まる。`is_locked()` は記録した期限で false になる

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use super::builder::Context;
use super::job::Job;
use crate::domain::{
    JobId, LeaseToken, MessageId, NewTask, Payload, Result, ShuttleError, TaskId, TaskRecord,
    TaskStatus,
};
use crate::ports::{Clock, OnInsert, StateStore};

/// renew は残り期間がこの割合になった時点で行う
const RENEW_REMAINING_RATIO: f64 = 0.2;

struct HeldLock {
    token: LeaseToken,
    locked_until: Arc<Mutex<DateTime<Utc>>>,
    renewal: CancellationToken,
    _stop_renewal: DropGuard,
}

pub struct Task {
    ctx: Context,
    record: TaskRecord,
    message_id: Option<MessageId>,
    lock: Mutex<Option<HeldLock>>,
}

impl Task {
    /// Idempotent creation: returns the existing id when the dedup tuple matches,
    /// otherwise persists a `queued` task and enqueues it on its queue.
    pub async fn create(ctx: &Context, attributes: NewTask) -> Result<TaskId> {
        if attributes.name.trim().is_empty() {
            return Err(ShuttleError::InvalidTaskAttributes(
                "task name must not be empty".into(),
            ));
        }
        let queue_name = attributes.queue_name.clone();
        if queue_name.trim().is_empty() {
            return Err(ShuttleError::InvalidQueueName(queue_name));
        }

        let queue = ctx.queue();
        let on_insert: OnInsert<'_> = Box::new(move |id: TaskId| {
            async move {
                queue.enqueue(&queue_name, id).await?;
                debug!(task_id = %id, queue = %queue_name, "task enqueued");
                Ok(())
            }
            .boxed()
        });
        ctx.store().find_or_create_task(attributes, on_insert).await
    }

    /// Pulls the next delivery from `queue_name` and loads its task.
    pub async fn fetch(ctx: &Context, queue_name: &str) -> Result<Self> {
        let delivery = ctx.queue().fetch_next(queue_name).await.map_err(|e| {
            ShuttleError::CouldNotFetchTask {
                queue_name: queue_name.to_string(),
                message_id: None,
                task_id: None,
                source: Box::new(e),
            }
        })?;

        match Self::load(ctx, delivery.task_id).await {
            Ok(mut task) => {
                task.message_id = Some(delivery.id);
                Ok(task)
            }
            Err(e) => Err(ShuttleError::CouldNotFetchTask {
                queue_name: queue_name.to_string(),
                message_id: Some(delivery.id),
                task_id: Some(delivery.task_id),
                source: Box::new(e),
            }),
        }
    }

    pub async fn load(ctx: &Context, id: TaskId) -> Result<Self> {
        let record = ctx
            .store()
            .find_task(id)
            .await?
            .ok_or(ShuttleError::TaskNotFound(id))?;
        Ok(Self::from_record(ctx, record))
    }

    pub async fn select(ctx: &Context, job_id: JobId) -> Result<Vec<Self>> {
        let records = ctx.store().select_tasks_by_job_id(job_id).await?;
        Ok(records
            .into_iter()
            .map(|record| Self::from_record(ctx, record))
            .collect())
    }

    /// Acknowledges a delivery whose task could not be loaded.
    pub async fn acknowledge_message_id(
        ctx: &Context,
        queue_name: &str,
        message_id: MessageId,
    ) -> Result<()> {
        ctx.queue().acknowledge(queue_name, message_id).await
    }

    fn from_record(ctx: &Context, record: TaskRecord) -> Self {
        Self {
            ctx: ctx.clone(),
            record,
            message_id: None,
            lock: Mutex::new(None),
        }
    }

    pub fn id(&self) -> TaskId {
        self.record.id
    }

    pub fn job_id(&self) -> JobId {
        self.record.job_id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn parent_task_id(&self) -> Option<TaskId> {
        self.record.parent_task_id
    }

    pub fn queue_name(&self) -> &str {
        &self.record.queue_name
    }

    pub fn payload(&self) -> &Payload {
        &self.record.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.record.updated_at
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.message_id
    }

    /// Snapshot taken when this value was loaded.
    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    pub async fn job(&self) -> Result<Job> {
        Job::find(&self.ctx, self.job_id()).await
    }

    /// Current status read from the store.
    pub async fn status(&self) -> Result<TaskStatus> {
        self.ctx
            .store()
            .find_task(self.id())
            .await?
            .map(|record| record.status)
            .ok_or(ShuttleError::TaskNotFound(self.id()))
    }

    pub async fn is_completed(&self) -> Result<bool> {
        Ok(self.status().await? == TaskStatus::Completed)
    }

    /// 再配送された終端 task か（ack して捨ててよい）
    pub async fn is_acknowledgeable(&self) -> Result<bool> {
        Ok(self.status().await?.is_acknowledgeable())
    }

    // lock

    pub async fn lock(&self) -> Result<bool> {
        if self.is_locked() {
            return Err(ShuttleError::LockAlreadyAcquired(self.id()));
        }

        let period = self.ctx.lease_period();
        let Some(lease) = self.ctx.store().acquire_lease(self.id(), period).await? else {
            debug!(task_id = %self.id(), "lease held elsewhere");
            return Ok(false);
        };

        let locked_until = Arc::new(Mutex::new(lease.locked_until));
        let cancel = CancellationToken::new();
        tokio::spawn(renew_lease(
            LeaseRenewal {
                store: self.ctx.store_handle(),
                clock: self.ctx.clock_handle(),
                task_id: self.id(),
                token: lease.token,
                period,
                locked_until: Arc::clone(&locked_until),
            },
            cancel.clone(),
        ));

        *self.held() = Some(HeldLock {
            token: lease.token,
            locked_until,
            renewal: cancel.clone(),
            _stop_renewal: cancel.drop_guard(),
        });
        debug!(task_id = %self.id(), until = %lease.locked_until, "task locked");
        Ok(true)
    }

    /// Stops renewal and releases the lease. Local lock state is cleared only
    /// when the store accepts the token; `Ok(false)` means the lease had expired
    /// or was taken over, and the recorded expiry is left to run out.
    pub async fn unlock(&self) -> Result<bool> {
        let token = {
            let held = self.held();
            let held = held
                .as_ref()
                .ok_or(ShuttleError::LockNotAcquired(self.id()))?;
            // release の前に更新タスクを止める
            held.renewal.cancel();
            held.token
        };

        let released = self.ctx.store().release_lease(self.id(), token).await?;
        if released {
            self.held().take();
        } else {
            warn!(task_id = %self.id(), "lease was already gone on unlock");
        }
        Ok(released)
    }

    /// Local view: a token is held and its recorded expiry is in the future.
    pub fn is_locked(&self) -> bool {
        let now = self.ctx.clock().now();
        self.held()
            .as_ref()
            .is_some_and(|held| *lock_ignoring_poison(&held.locked_until) > now)
    }

    pub fn locked_until(&self) -> Option<DateTime<Utc>> {
        self.held()
            .as_ref()
            .map(|held| *lock_ignoring_poison(&held.locked_until))
    }

    fn held(&self) -> std::sync::MutexGuard<'_, Option<HeldLock>> {
        lock_ignoring_poison(&self.lock)
    }

    // status

    pub async fn mark_queued(&self) -> Result<()> {
        self.set_status(TaskStatus::Queued).await
    }

    pub async fn mark_working(&self) -> Result<()> {
        self.set_status(TaskStatus::Working).await
    }

    pub async fn mark_completed(&self) -> Result<()> {
        self.set_status(TaskStatus::Completed).await
    }

    pub async fn mark_failed(&self) -> Result<()> {
        self.set_status(TaskStatus::Failed).await
    }

    pub async fn mark_invalid_payload(&self) -> Result<()> {
        self.set_status(TaskStatus::InvalidPayload).await
    }

    async fn set_status(&self, status: TaskStatus) -> Result<()> {
        self.ctx.store().update_status(self.id(), status).await
    }

    // delivery

    pub async fn acknowledge_message(&self) -> Result<()> {
        let message_id = self
            .message_id
            .ok_or(ShuttleError::MessageNotReceived(self.id()))?;
        self.ctx
            .queue()
            .acknowledge(self.queue_name(), message_id)
            .await
    }

    /// Acknowledges the current delivery and enqueues the task again.
    pub async fn requeue(&self) -> Result<()> {
        self.acknowledge_message().await?;
        self.ctx.queue().enqueue(self.queue_name(), self.id()).await
    }

    /// Acknowledges the current delivery and enqueues the task on `<queue>-failed`.
    pub async fn enqueue_in_failure_queue(&self) -> Result<()> {
        self.acknowledge_message().await?;
        self.mirror_to_failure_queue().await
    }

    /// Enqueues the task on `<queue>-failed`, leaving the current delivery alone.
    pub async fn mirror_to_failure_queue(&self) -> Result<()> {
        self.ctx
            .queue()
            .enqueue_to_failed(self.queue_name(), self.id())
            .await
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("record", &self.record)
            .field("message_id", &self.message_id)
            .field("locked_until", &self.locked_until())
            .finish()
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LeaseRenewal {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    task_id: TaskId,
    token: LeaseToken,
    period: Duration,
    locked_until: Arc<Mutex<DateTime<Utc>>>,
}

impl LeaseRenewal {
    fn wait_before_renewal(&self) -> Duration {
        let until = *lock_ignoring_poison(&self.locked_until);
        let margin = TimeDelta::from_std(self.period.mul_f64(RENEW_REMAINING_RATIO))
            .unwrap_or(TimeDelta::zero());
        (until - margin - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

async fn renew_lease(renewal: LeaseRenewal, cancel: CancellationToken) {
    loop {
        let wait = renewal.wait_before_renewal();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let renewed = renewal
            .store
            .renew_lease(renewal.task_id, renewal.period, renewal.token)
            .await;
        if cancel.is_cancelled() {
            return;
        }
        match renewed {
            Ok(Some(until)) => {
                debug!(task_id = %renewal.task_id, until = %until, "lease renewed");
                *lock_ignoring_poison(&renewal.locked_until) = until;
            }
            Ok(None) => {
                warn!(task_id = %renewal.task_id, "lease renewal rejected, lease will expire");
                return;
            }
            Err(e) => {
                warn!(task_id = %renewal.task_id, error = %e, "lease renewal failed");
                return;
            }
        }
    }
}
