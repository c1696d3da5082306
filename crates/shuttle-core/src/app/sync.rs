//! SyncWorker - fan-out した兄弟 task を待つバリア（fan-in）
//!
//! 自分の task type の `waits_for` に並ぶ型ごとに条件を評価します。
//! 兄弟は「自分の親を祖先に持つ、待っている型の task」です
//! （[`Job::find_task_ids_by_name_and_ancestor_task_id`]）。
//!
//! - `eq_completed`: `payload[param]` 個以上の兄弟が存在し、全て completed
//! - `completed`: 兄弟が1つ以上存在し、全て completed
//!
//! 条件が揃わなければ `Outcome::Blocked` を返し、worker が queued に戻して
//! 再配送を待ちます。揃ったら内側の handler を1回だけ実行します。

use async_trait::async_trait;
use tracing::debug;

use super::builder::Context;
use super::handler::{NoopHandler, TaskHandler};
use super::job::Job;
use super::task::Task;
use super::worker::{Worker, WorkerOptions};
use crate::domain::{Outcome, Result, ShuttleError, SyncCondition, SyncFunction, TaskId};

#[derive(Debug)]
pub struct SyncWorker {
    worker: Worker,
}

impl SyncWorker {
    pub fn new(ctx: &Context, options: WorkerOptions) -> Result<Self> {
        Ok(Self {
            worker: Worker::new(ctx, options)?,
        })
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Completes each sync task once its barrier is satisfied.
    pub async fn work(&self, queue_name: &str, blocking: bool) -> Result<()> {
        self.work_with(queue_name, &NoopHandler, blocking).await
    }

    /// Runs `handler` once per sync task after its barrier is satisfied.
    pub async fn work_with<H>(&self, queue_name: &str, handler: &H, blocking: bool) -> Result<()>
    where
        H: TaskHandler + ?Sized,
    {
        let barrier = Barrier { inner: handler };
        self.worker.work(queue_name, &barrier, blocking).await
    }
}

struct Barrier<'a, H: ?Sized> {
    inner: &'a H,
}

#[async_trait]
impl<H> TaskHandler for Barrier<'_, H>
where
    H: TaskHandler + ?Sized,
{
    async fn handle(&self, task: &Task) -> Result<Outcome> {
        let job = task.job().await?;
        let waited = job.tasks_to_wait_for(task);
        debug!(task_id = %task.id(), waits_for = ?waited, "checking barrier");

        for waited_type in waited {
            let Some(condition) = job.sync_condition(task, waited_type) else {
                continue;
            };
            if let Outcome::Blocked(reason) = check(&job, task, waited_type, condition).await? {
                debug!(task_id = %task.id(), waited_type, reason = %reason, "barrier not satisfied");
                return Ok(Outcome::Blocked(reason));
            }
        }

        self.inner.handle(task).await
    }
}

async fn check(job: &Job, task: &Task, waited_type: &str, condition: &SyncCondition) -> Result<Outcome> {
    let siblings = job
        .find_task_ids_by_name_and_ancestor_task_id(waited_type, task.parent_task_id())
        .await?;

    match condition.function {
        SyncFunction::EqCompleted => {
            let expected = expected_count(task, condition)?;
            if (siblings.len() as u64) < expected {
                return Ok(Outcome::blocked(format!(
                    "{} of {expected} {waited_type} created",
                    siblings.len()
                )));
            }
        }
        SyncFunction::Completed => {
            if siblings.is_empty() {
                return Ok(Outcome::blocked(format!("no {waited_type} created yet")));
            }
        }
    }

    all_completed(job, waited_type, &siblings).await
}

fn expected_count(task: &Task, condition: &SyncCondition) -> Result<u64> {
    let param = condition.param.as_deref().ok_or_else(|| {
        ShuttleError::InvalidTaskAttributes(format!("{} needs a param for eq_completed", task.name()))
    })?;
    task.payload()
        .get(param)
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| {
            ShuttleError::InvalidTaskAttributes(format!(
                "{} payload must carry a non-negative integer {param:?}",
                task.name()
            ))
        })
}

async fn all_completed(job: &Job, waited_type: &str, siblings: &[TaskId]) -> Result<Outcome> {
    let done = job.status_counts_of(siblings).await?.completed;
    if done < siblings.len() {
        return Ok(Outcome::blocked(format!(
            "{done} of {} {waited_type} completed",
            siblings.len()
        )));
    }
    Ok(Outcome::success())
}
