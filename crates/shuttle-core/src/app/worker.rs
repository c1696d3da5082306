//! Worker - 1つのキューに張り付くポーリングループ
//!
//! # 1 イテレーション
//! 1. `before` フック
//! 2. `around` フックの中で取得と処理
//!    - 取得失敗: task 行が無ければ配送を ack して次へ。それ以外はバックオフで
//!      リトライし、使い切ったらログだけ出す（ack しない）
//!    - 終端状態の再配送: ack して捨てる
//!    - payload 検証エラー: `invalid_payload` にして ack
//!    - lock 競合: 何もしない（他の worker が持っている）
//!    - 実行: `working` にして handler を呼ぶ（timeout 付きにもできる）
//! 3. `after` フック
//!
//! # 結果ごとの後始末
//! - `Success`: トランザクション内で「次の task 作成 → unlock → completed」、その後 ack。
//!   commit 後の ack 失敗は warn だけ（completed のまま。再配送は終端として捨てられる）
//! - `Blocked`: トランザクション内で「unlock → queued」。ack しないので再配送を待つ。
//!   試行回数には数えない
//! - `Err`: トランザクション内で「(失敗キューへ複製) → unlock → queued」。
//!   `max_attempts` に達していたら `failed` にして ack
//!
//! 試行回数は body が `Success` か `Err` で終わったときだけ増えます。
//!
//! ループは1つの task の失敗で止まりません。止めるのは `blocking = false` か
//! `shutdown_token()` の cancel だけです。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::builder::Context;
use super::handler::TaskHandler;
use super::hooks::{NoHooks, WorkerHooks};
use super::task::Task;
use super::validation::PayloadRules;
use crate::domain::payload;
use crate::domain::{Outcome, Result, ShuttleError, WorkerId};

/// Typed worker configuration, validated by [`Worker::new`].
#[derive(Clone)]
pub struct WorkerOptions {
    pub hooks: Arc<dyn WorkerHooks>,
    pub rules: PayloadRules,
    /// 失敗した task を `<queue>-failed` にも積む
    pub failure_queue: bool,
    /// Upper bound on one handler call; exceeding it counts as a failure.
    pub timeout: Option<Duration>,
    /// `None` なら再配送で無限にリトライする
    pub max_attempts: Option<u32>,
    pub fetch_retry: Backoff,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            hooks: Arc::new(NoHooks),
            rules: PayloadRules::default(),
            failure_queue: false,
            timeout: None,
            max_attempts: None,
            fetch_retry: Backoff::default(),
        }
    }
}

impl WorkerOptions {
    pub fn hooks(mut self, hooks: Arc<dyn WorkerHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn rules(mut self, rules: PayloadRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn failure_queue(mut self, enabled: bool) -> Self {
        self.failure_queue = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn fetch_retry(mut self, backoff: Backoff) -> Self {
        self.fetch_retry = backoff;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ShuttleError::InvalidWorkerConfiguration {
                name: "timeout",
                value: "0s".into(),
            });
        }
        if self.max_attempts == Some(0) {
            return Err(ShuttleError::InvalidWorkerConfiguration {
                name: "max_attempts",
                value: "0".into(),
            });
        }
        if !(self.fetch_retry.multiplier.is_finite() && self.fetch_retry.multiplier >= 1.0) {
            return Err(ShuttleError::InvalidWorkerConfiguration {
                name: "fetch_retry.multiplier",
                value: self.fetch_retry.multiplier.to_string(),
            });
        }
        if self.fetch_retry.max_delay.is_zero() {
            return Err(ShuttleError::InvalidWorkerConfiguration {
                name: "fetch_retry.max_delay",
                value: "0s".into(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("rules", &self.rules)
            .field("failure_queue", &self.failure_queue)
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .field("fetch_retry", &self.fetch_retry)
            .finish_non_exhaustive()
    }
}

pub struct Worker {
    id: WorkerId,
    ctx: Context,
    options: WorkerOptions,
    processed: AtomicU64,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(ctx: &Context, options: WorkerOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            id: ctx.ids().next(),
            ctx: ctx.clone(),
            options,
            processed: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Tasks this worker drove to `completed`.
    pub fn processed_tasks(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Cancelling the token stops the loop at the next iteration boundary
    /// (or while it waits for a delivery).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Polls `queue_name`, running `handler` on every task.
    ///
    /// `blocking = false` runs a single iteration. The fetch inside it still waits
    /// for a delivery, so callers usually enqueue first.
    pub async fn work<H>(&self, queue_name: &str, handler: &H, blocking: bool) -> Result<()>
    where
        H: TaskHandler + ?Sized,
    {
        if queue_name.trim().is_empty() {
            return Err(ShuttleError::InvalidQueueName(queue_name.to_string()));
        }
        info!(worker = %self.id, queue = queue_name, "worker started");

        let hooks = Arc::clone(&self.options.hooks);
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            hooks.before(queue_name).await;
            hooks
                .around(queue_name, self.run_once(queue_name, handler).boxed())
                .await;
            hooks.after(queue_name).await;

            if !blocking {
                break;
            }
        }

        info!(
            worker = %self.id,
            queue = queue_name,
            processed = self.processed_tasks(),
            "worker stopped"
        );
        Ok(())
    }

    async fn run_once<H>(&self, queue_name: &str, handler: &H)
    where
        H: TaskHandler + ?Sized,
    {
        let Some(task) = self.fetch(queue_name).await else {
            return;
        };
        if let Err(e) = self.process(&task, handler).await {
            error!(
                worker = %self.id,
                task_id = %task.id(),
                error = %e,
                "task processing failed"
            );
        }
    }

    async fn fetch(&self, queue_name: &str) -> Option<Task> {
        let backoff = &self.options.fetch_retry;
        let mut retries = 0;
        loop {
            let fetched = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                fetched = Task::fetch(&self.ctx, queue_name) => fetched,
            };

            let err = match fetched {
                Ok(task) => return Some(task),
                Err(e) if e.is_missing_task() => {
                    self.acknowledge_orphan(queue_name, &e).await;
                    return None;
                }
                Err(e) => e,
            };

            if retries >= backoff.max_retries {
                error!(worker = %self.id, queue = queue_name, error = %err, "giving up on fetch");
                return None;
            }
            retries += 1;
            let delay = backoff.next_delay(retries);
            warn!(
                worker = %self.id,
                queue = queue_name,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "fetch failed, retrying"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn acknowledge_orphan(&self, queue_name: &str, err: &ShuttleError) {
        let ShuttleError::CouldNotFetchTask {
            message_id: Some(message_id),
            task_id,
            ..
        } = err
        else {
            warn!(worker = %self.id, queue = queue_name, error = %err, "orphaned delivery without id");
            return;
        };

        warn!(
            worker = %self.id,
            queue = queue_name,
            message_id = %message_id,
            task_id = ?task_id,
            "task no longer exists, acknowledging delivery"
        );
        if let Err(e) = Task::acknowledge_message_id(&self.ctx, queue_name, *message_id).await {
            error!(worker = %self.id, error = %e, "could not acknowledge orphaned delivery");
        }
    }

    async fn process<H>(&self, task: &Task, handler: &H) -> Result<()>
    where
        H: TaskHandler + ?Sized,
    {
        if task.is_acknowledgeable().await? {
            debug!(worker = %self.id, task_id = %task.id(), "discarding redelivered terminal task");
            return task.acknowledge_message().await;
        }

        if let Err(errors) = self.options.rules.validate(task.payload()) {
            let err = ShuttleError::PayloadValidation(errors);
            warn!(worker = %self.id, task_id = %task.id(), error = %err, "invalid payload");
            task.mark_invalid_payload().await?;
            return task.acknowledge_message().await;
        }

        if !task.lock().await? {
            debug!(worker = %self.id, task_id = %task.id(), "task is locked by another worker");
            return Ok(());
        }

        if let Err(e) = task.mark_working().await {
            release(task).await?;
            return Err(e);
        }
        debug!(worker = %self.id, task_id = %task.id(), task = task.name(), "executing");

        match self.run_handler(task, handler).await {
            Ok(Outcome::Success) => match self.complete(task).await {
                Ok(()) => Ok(()),
                Err(e) => self.fail(task, e).await,
            },
            Ok(Outcome::Blocked(reason)) => self.defer(task, &reason).await,
            Err(e) => self.fail(task, e).await,
        }
    }

    async fn run_handler<H>(&self, task: &Task, handler: &H) -> Result<Outcome>
    where
        H: TaskHandler + ?Sized,
    {
        match self.options.timeout {
            Some(limit) => tokio::time::timeout(limit, handler.handle(task))
                .await
                .map_err(|_| ShuttleError::Timeout(limit))?,
            None => handler.handle(task).await,
        }
    }

    /// `Err` only comes from before or inside the transaction. Errors after the
    /// commit are logged and the task stays `completed`.
    async fn complete(&self, task: &Task) -> Result<()> {
        let job = task.job().await?;
        let merged = payload::merge(job.payload(), task.payload());

        self.ctx
            .store()
            .run_in_transaction(
                async {
                    job.create_next_tasks(task, &merged).await?;
                    self.ctx.store().increment_attempts(task.id()).await?;
                    task.unlock().await?;
                    task.mark_completed().await
                }
                .boxed(),
            )
            .await?;

        self.processed.fetch_add(1, Ordering::Relaxed);
        info!(worker = %self.id, task_id = %task.id(), task = task.name(), "task completed");
        if let Err(e) = task.acknowledge_message().await {
            warn!(
                worker = %self.id,
                task_id = %task.id(),
                error = %e,
                "could not acknowledge completed task, redelivery will be discarded"
            );
        }
        Ok(())
    }

    async fn defer(&self, task: &Task, reason: &str) -> Result<()> {
        debug!(worker = %self.id, task_id = %task.id(), reason, "task blocked, awaiting redelivery");
        self.ctx
            .store()
            .run_in_transaction(
                async {
                    task.unlock().await?;
                    task.mark_queued().await
                }
                .boxed(),
            )
            .await
    }

    async fn fail(&self, task: &Task, err: ShuttleError) -> Result<()> {
        warn!(
            worker = %self.id,
            task_id = %task.id(),
            task = task.name(),
            error = %err,
            "task failed"
        );

        let failure_queue = self.options.failure_queue;
        let max_attempts = self.options.max_attempts;
        let mut attempts = 0;
        let mut give_up = false;
        self.ctx
            .store()
            .run_in_transaction(
                async {
                    attempts = self.ctx.store().increment_attempts(task.id()).await?;
                    give_up = max_attempts.is_some_and(|max| attempts >= max);
                    if failure_queue {
                        task.mirror_to_failure_queue().await?;
                    }
                    release(task).await?;
                    if give_up {
                        task.mark_failed().await
                    } else {
                        task.mark_queued().await
                    }
                }
                .boxed(),
            )
            .await?;

        if give_up {
            error!(worker = %self.id, task_id = %task.id(), attempts, "retry limit reached, task failed");
            task.acknowledge_message().await?;
        } else {
            debug!(worker = %self.id, task_id = %task.id(), attempts, "awaiting redelivery");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("processed", &self.processed_tasks())
            .finish()
    }
}

/// Unlocks if this instance still holds the lease.
async fn release(task: &Task) -> Result<()> {
    match task.unlock().await {
        Ok(_) | Err(ShuttleError::LockNotAcquired(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::hooks::WorkerHooks;
    use crate::app::job::Job;
    use crate::app::validation::{FieldRule, ValueKind};
    use crate::app::workflow::Workflow;
    use crate::domain::descriptor::fixtures;
    use crate::domain::{Delivery, MessageId, TaskId, TaskStatus};
    use crate::impls::{InMemoryDeliveryQueue, InMemoryStateStore};
    use crate::ports::DeliveryQueue;
    use async_trait::async_trait;
    use rstest::rstest;
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        ctx: Context,
        queue: Arc<InMemoryDeliveryQueue>,
    }

    fn harness() -> Harness {
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let ctx = Context::builder()
            .queue(queue.clone())
            .store(Arc::new(InMemoryStateStore::new()))
            .build()
            .unwrap();
        Harness { ctx, queue }
    }

    async fn started_job(ctx: &Context, payload: serde_json::Value) -> Job {
        let workflow = Workflow::create(ctx, "linear", &fixtures::linear()).await.unwrap();
        let job = Job::create(ctx, &workflow, payload::from_value(payload).unwrap())
            .await
            .unwrap();
        job.start().await.unwrap();
        job
    }

    async fn only_task(ctx: &Context, job: &Job, name: &str) -> Task {
        let ids = job.find_task_ids_by_name(name).await.unwrap();
        assert_eq!(ids.len(), 1, "expected one {name} task");
        Task::load(ctx, ids[0]).await.unwrap()
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl Counting {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskHandler for Counting {
        async fn handle(&self, task: &Task) -> Result<Outcome> {
            assert_eq!(task.status().await?, TaskStatus::Working);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Outcome::success())
        }
    }

    struct Failing;

    #[async_trait]
    impl TaskHandler for Failing {
        async fn handle(&self, _task: &Task) -> Result<Outcome> {
            Err(ShuttleError::execution("boom"))
        }
    }

    struct Slow;

    #[async_trait]
    impl TaskHandler for Slow {
        async fn handle(&self, _task: &Task) -> Result<Outcome> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Outcome::success())
        }
    }

    struct Waiting;

    #[async_trait]
    impl TaskHandler for Waiting {
        async fn handle(&self, _task: &Task) -> Result<Outcome> {
            Ok(Outcome::blocked("not yet"))
        }
    }

    #[tokio::test]
    async fn success_completes_and_creates_next_tasks() {
        let h = harness();
        let job = started_job(&h.ctx, json!({"url": "x", "parse": {"strict": true}})).await;
        let worker = Worker::new(&h.ctx, WorkerOptions::default()).unwrap();
        let handler = Counting::default();

        worker.work("fetch", &handler, false).await.unwrap();

        assert_eq!(handler.calls(), 1);
        assert_eq!(worker.processed_tasks(), 1);
        let fetch = only_task(&h.ctx, &job, "fetch").await;
        assert_eq!(fetch.status().await.unwrap(), TaskStatus::Completed);
        assert_eq!(fetch.record().attempts, 1);
        assert_eq!(h.queue.in_flight("fetch").await, 0);

        let parse = only_task(&h.ctx, &job, "parse").await;
        assert_eq!(parse.parent_task_id(), Some(fetch.id()));
        assert_eq!(parse.payload(), &payload::from_value(json!({"url": "x", "strict": true})).unwrap());
        let index = only_task(&h.ctx, &job, "index").await;
        assert_eq!(index.payload(), &payload::from_value(json!({"url": "x"})).unwrap());
        assert_eq!(h.queue.len("parse").await, 1);
        assert_eq!(h.queue.len("index").await, 1);
    }

    #[rstest]
    #[case::plain(false, 0)]
    #[case::with_failure_queue(true, 1)]
    #[tokio::test]
    async fn failure_requeues_without_acknowledging(
        #[case] failure_queue: bool,
        #[case] mirrored: usize,
    ) {
        let h = harness();
        let job = started_job(&h.ctx, json!({})).await;
        let worker = Worker::new(&h.ctx, WorkerOptions::default().failure_queue(failure_queue)).unwrap();

        worker.work("fetch", &Failing, false).await.unwrap();

        let fetch = only_task(&h.ctx, &job, "fetch").await;
        assert_eq!(fetch.status().await.unwrap(), TaskStatus::Queued);
        assert_eq!(h.queue.in_flight("fetch").await, 1);
        assert_eq!(h.queue.len("fetch-failed").await, mirrored);
        assert!(job.find_task_ids_by_name("parse").await.unwrap().is_empty());
        assert_eq!(worker.processed_tasks(), 0);

        // lease は解放済み
        assert!(fetch.lock().await.unwrap());
    }

    #[tokio::test]
    async fn retry_limit_marks_failed_and_acknowledges() {
        let h = harness();
        let job = started_job(&h.ctx, json!({})).await;
        let options = WorkerOptions::default().failure_queue(true).max_attempts(1);
        let worker = Worker::new(&h.ctx, options).unwrap();

        worker.work("fetch", &Failing, false).await.unwrap();

        let fetch = only_task(&h.ctx, &job, "fetch").await;
        assert_eq!(fetch.status().await.unwrap(), TaskStatus::Failed);
        assert_eq!(h.queue.in_flight("fetch").await, 0);
        assert_eq!(h.queue.len("fetch-failed").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let h = harness();
        let job = started_job(&h.ctx, json!({})).await;
        let options = WorkerOptions::default().timeout(Duration::from_secs(1));
        let worker = Worker::new(&h.ctx, options).unwrap();

        worker.work("fetch", &Slow, false).await.unwrap();

        let fetch = only_task(&h.ctx, &job, "fetch").await;
        assert_eq!(fetch.status().await.unwrap(), TaskStatus::Queued);
        assert!(job.find_task_ids_by_name("parse").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blocked_outcome_requeues_quietly() {
        let h = harness();
        let job = started_job(&h.ctx, json!({})).await;
        let options = WorkerOptions::default().failure_queue(true);
        let worker = Worker::new(&h.ctx, options).unwrap();

        worker.work("fetch", &Waiting, false).await.unwrap();

        let fetch = only_task(&h.ctx, &job, "fetch").await;
        assert_eq!(fetch.status().await.unwrap(), TaskStatus::Queued);
        assert_eq!(h.queue.in_flight("fetch").await, 1);
        assert_eq!(h.queue.len("fetch-failed").await, 0);
        assert!(fetch.lock().await.unwrap());
    }

    #[tokio::test]
    async fn blocked_outcomes_do_not_use_up_attempts() {
        let h = harness();
        let job = started_job(&h.ctx, json!({})).await;
        let options = WorkerOptions::default().max_attempts(1);
        let worker = Worker::new(&h.ctx, options).unwrap();

        worker.work("fetch", &Waiting, false).await.unwrap();

        let fetch = only_task(&h.ctx, &job, "fetch").await;
        let reloaded = Task::load(&h.ctx, fetch.id()).await.unwrap();
        assert_eq!(reloaded.record().attempts, 0);
        assert_eq!(fetch.status().await.unwrap(), TaskStatus::Queued);
    }

    /// Hands out deliveries but refuses every acknowledge.
    struct RefusingAck(Arc<InMemoryDeliveryQueue>);

    #[async_trait]
    impl DeliveryQueue for RefusingAck {
        async fn enqueue(&self, queue_name: &str, task_id: TaskId) -> Result<()> {
            self.0.enqueue(queue_name, task_id).await
        }

        async fn fetch_next(&self, queue_name: &str) -> Result<Delivery> {
            self.0.fetch_next(queue_name).await
        }

        async fn acknowledge(&self, _queue_name: &str, _message_id: MessageId) -> Result<()> {
            Err(ShuttleError::Queue("acknowledge refused".into()))
        }
    }

    #[tokio::test]
    async fn acknowledge_failure_after_commit_keeps_task_completed() {
        let inner = Arc::new(InMemoryDeliveryQueue::new());
        let ctx = Context::builder()
            .queue(Arc::new(RefusingAck(inner.clone())))
            .store(Arc::new(InMemoryStateStore::new()))
            .build()
            .unwrap();
        let job = started_job(&ctx, json!({})).await;
        let options = WorkerOptions::default().failure_queue(true).max_attempts(1);
        let worker = Worker::new(&ctx, options).unwrap();
        let handler = Counting::default();

        worker.work("fetch", &handler, false).await.unwrap();

        assert_eq!(handler.calls(), 1);
        assert_eq!(worker.processed_tasks(), 1);
        let fetch = only_task(&ctx, &job, "fetch").await;
        assert_eq!(fetch.status().await.unwrap(), TaskStatus::Completed);
        assert_eq!(inner.len("fetch-failed").await, 0);
        assert_eq!(job.find_task_ids_by_name("parse").await.unwrap().len(), 1);
        assert_eq!(inner.in_flight("fetch").await, 1);
    }

    #[tokio::test]
    async fn invalid_payload_is_terminal_and_acknowledged() {
        let h = harness();
        let job = started_job(&h.ctx, json!({"url": 3})).await;
        let rules = PayloadRules::new().field("url", FieldRule::new().presence().kind(ValueKind::String));
        let worker = Worker::new(&h.ctx, WorkerOptions::default().rules(rules)).unwrap();
        let handler = Counting::default();

        worker.work("fetch", &handler, false).await.unwrap();

        assert_eq!(handler.calls(), 0);
        let fetch = only_task(&h.ctx, &job, "fetch").await;
        assert_eq!(fetch.status().await.unwrap(), TaskStatus::InvalidPayload);
        assert_eq!(h.queue.in_flight("fetch").await, 0);
        assert_eq!(h.queue.len("fetch-failed").await, 0);
    }

    #[tokio::test]
    async fn redelivered_terminal_task_is_discarded() {
        let h = harness();
        let job = started_job(&h.ctx, json!({})).await;
        let fetch = only_task(&h.ctx, &job, "fetch").await;
        fetch.mark_completed().await.unwrap();
        let worker = Worker::new(&h.ctx, WorkerOptions::default()).unwrap();
        let handler = Counting::default();

        worker.work("fetch", &handler, false).await.unwrap();

        assert_eq!(handler.calls(), 0);
        assert_eq!(h.queue.in_flight("fetch").await, 0);
        assert!(job.find_task_ids_by_name("parse").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn locked_task_is_left_alone() {
        let h = harness();
        let job = started_job(&h.ctx, json!({})).await;
        let owner = only_task(&h.ctx, &job, "fetch").await;
        assert!(owner.lock().await.unwrap());
        let worker = Worker::new(&h.ctx, WorkerOptions::default()).unwrap();
        let handler = Counting::default();

        worker.work("fetch", &handler, false).await.unwrap();

        assert_eq!(handler.calls(), 0);
        assert_eq!(owner.status().await.unwrap(), TaskStatus::Queued);
        assert_eq!(h.queue.in_flight("fetch").await, 1);
    }

    #[tokio::test]
    async fn orphaned_delivery_is_acknowledged() {
        let h = harness();
        let ghost = h.ctx.ids().next();
        h.queue.enqueue("fetch", ghost).await.unwrap();
        let worker = Worker::new(&h.ctx, WorkerOptions::default()).unwrap();
        let handler = Counting::default();

        worker.work("fetch", &handler, false).await.unwrap();

        assert_eq!(handler.calls(), 0);
        assert_eq!(h.queue.in_flight("fetch").await, 0);
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<&'static str>>);

    #[async_trait]
    impl WorkerHooks for Recorder {
        async fn before(&self, _queue_name: &str) {
            self.0.lock().unwrap().push("before");
        }

        async fn around<'a>(&'a self, _queue_name: &'a str, iteration: BoxFuture<'a, ()>) {
            self.0.lock().unwrap().push("around");
            iteration.await;
        }

        async fn after(&self, _queue_name: &str) {
            self.0.lock().unwrap().push("after");
        }
    }

    #[tokio::test]
    async fn hooks_wrap_each_iteration() {
        let h = harness();
        started_job(&h.ctx, json!({})).await;
        let hooks = Arc::new(Recorder::default());
        let worker = Worker::new(&h.ctx, WorkerOptions::default().hooks(hooks.clone())).unwrap();

        worker.work("fetch", &Counting::default(), false).await.unwrap();

        assert_eq!(*hooks.0.lock().unwrap(), vec!["before", "around", "after"]);
    }

    #[tokio::test]
    async fn shutdown_stops_a_blocking_loop() {
        let h = harness();
        let worker = Arc::new(Worker::new(&h.ctx, WorkerOptions::default()).unwrap());
        let running = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.work("idle", &Counting::default(), true).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.shutdown();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("worker did not stop")
            .unwrap()
            .unwrap();
    }

    #[rstest]
    #[case::zero_timeout(WorkerOptions::default().timeout(Duration::ZERO), "timeout")]
    #[case::zero_attempts(WorkerOptions::default().max_attempts(0), "max_attempts")]
    #[case::zero_max_delay(
        WorkerOptions::default().fetch_retry(Backoff { max_delay: Duration::ZERO, ..Backoff::default() }),
        "fetch_retry.max_delay"
    )]
    #[case::nan_multiplier(
        WorkerOptions::default().fetch_retry(Backoff { multiplier: f64::NAN, ..Backoff::default() }),
        "fetch_retry.multiplier"
    )]
    fn invalid_options_are_rejected(#[case] options: WorkerOptions, #[case] field: &str) {
        let ctx = Context::in_memory();
        match Worker::new(&ctx, options) {
            Err(ShuttleError::InvalidWorkerConfiguration { name, .. }) => assert_eq!(name, field),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_queue_name_is_rejected() {
        let ctx = Context::in_memory();
        let worker = Worker::new(&ctx, WorkerOptions::default()).unwrap();
        assert!(matches!(
            worker.work("", &Counting::default(), false).await,
            Err(ShuttleError::InvalidQueueName(_))
        ));
    }
}
