//! End-to-end: workflow → job → workers on the in-memory backends.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use shuttle_core::app::{FieldRule, PayloadRules, ValueKind};
use shuttle_core::domain::{Payload, TaskId, TaskStatus, payload};
use shuttle_core::impls::{InMemoryDeliveryQueue, InMemoryStateStore};
use shuttle_core::{
    Context, Job, Outcome, Result, ShuttleError, SplitOptions, SplitWorker, SyncWorker, Task,
    TaskHandler, Worker, WorkerOptions, Workflow,
};

fn split_n_sync() -> Value {
    json!({
        "starts": ["split:array"],
        "tasks": {
            "split:array": {
                "queue": "split-array",
                "starts_manually": ["print:array"],
                "starts_with_params": {
                    "report:success": { "nr_tasks": { "count": "print:array" } }
                }
            },
            "print:array": { "queue": "print-array" },
            "report:success": {
                "queue": "report-success",
                "waits_for": {
                    "print:array": {
                        "condition": { "param": "nr_tasks", "function": "eq_completed" }
                    }
                }
            }
        }
    })
}

fn hello() -> Value {
    json!({
        "starts": ["say:hello"],
        "tasks": {
            "say:hello": { "queue": "hello" }
        }
    })
}

struct Harness {
    ctx: Context,
    queue: Arc<InMemoryDeliveryQueue>,
}

fn harness() -> Harness {
    let queue = Arc::new(InMemoryDeliveryQueue::with_redelivery(Duration::from_millis(30)));
    let ctx = Context::builder()
        .queue(queue.clone())
        .store(Arc::new(InMemoryStateStore::new()))
        .build()
        .unwrap();
    Harness { ctx, queue }
}

fn p(value: Value) -> Payload {
    payload::from_value(value).unwrap()
}

fn spawn<F>(work: F) -> JoinHandle<Result<()>>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(work)
}

/// 全 task が終端状態になるまで待つ
async fn wait_until_settled(job: &Job, expected_tasks: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let counts = job.task_status_counts().await.unwrap();
            if counts.total() == expected_tasks && counts.queued + counts.working == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not settle");
}

#[derive(Default)]
struct Greeter {
    seen: Mutex<Vec<Value>>,
}

#[async_trait]
impl TaskHandler for Greeter {
    async fn handle(&self, task: &Task) -> Result<Outcome> {
        self.seen
            .lock()
            .unwrap()
            .push(Value::Object(task.payload().clone()));
        Ok(Outcome::success())
    }
}

#[tokio::test]
async fn hello_task_runs_to_completion() {
    let h = harness();
    let workflow = Workflow::create(&h.ctx, "hello", &hello()).await.unwrap();
    let job = Job::create(&h.ctx, &workflow, p(json!({"name": "world"}))).await.unwrap();
    let roots = job.start().await.unwrap();
    assert_eq!(roots.len(), 1);
    let task_id = roots[0];

    let worker = Worker::new(&h.ctx, WorkerOptions::default()).unwrap();
    let greeter = Greeter::default();
    worker.work("hello", &greeter, false).await.unwrap();

    assert_eq!(*greeter.seen.lock().unwrap(), vec![json!({"name": "world"})]);
    let task = Task::load(&h.ctx, task_id).await.unwrap();
    assert_eq!(task.status().await.unwrap(), TaskStatus::Completed);
    assert_eq!(h.queue.in_flight("hello").await, 0);
    assert_eq!(Job::clear_completed(&h.ctx).await.unwrap(), 1);
    assert_eq!(Job::count(&h.ctx).await.unwrap(), 0);
}

/// 各 task の最初の試行だけ失敗する
#[derive(Default)]
struct FlakyOnce {
    failed: Mutex<HashSet<TaskId>>,
    runs: AtomicUsize,
}

#[async_trait]
impl TaskHandler for FlakyOnce {
    async fn handle(&self, task: &Task) -> Result<Outcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.failed.lock().unwrap().insert(task.id()) {
            return Err(ShuttleError::execution("first attempt fails"));
        }
        Ok(Outcome::success())
    }
}

#[tokio::test]
async fn failed_task_is_retried_through_redelivery() {
    let h = harness();
    let workflow = Workflow::create(&h.ctx, "hello", &hello()).await.unwrap();
    let job = Job::create(&h.ctx, &workflow, Payload::new()).await.unwrap();
    job.start().await.unwrap();

    let worker = Worker::new(&h.ctx, WorkerOptions::default().failure_queue(true)).unwrap();
    let flaky = FlakyOnce::default();

    worker.work("hello", &flaky, false).await.unwrap();
    let counts = job.task_status_counts().await.unwrap();
    assert_eq!((counts.queued, counts.failed), (1, 0));
    assert_eq!(h.queue.len("hello-failed").await, 1);

    // 配送は ack されていないので、可視性タイムアウト後に戻ってくる
    worker.work("hello", &flaky, false).await.unwrap();
    assert_eq!(job.task_status_counts().await.unwrap().completed, 1);
    assert_eq!(flaky.runs.load(Ordering::SeqCst), 2);
    assert_eq!(h.queue.in_flight("hello").await, 0);
}

/// print 本体。配列の要素を記録する
#[derive(Default)]
struct Printer {
    printed: Mutex<Vec<Value>>,
}

#[async_trait]
impl TaskHandler for Printer {
    async fn handle(&self, task: &Task) -> Result<Outcome> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if let Some(Value::Array(items)) = task.payload().get("array") {
            self.printed.lock().unwrap().extend(items.iter().cloned());
        }
        Ok(Outcome::success())
    }
}

/// sync 本体。実行時点で兄弟が全て completed であることを確かめる
struct Reporter {
    ctx: Context,
    runs: AtomicUsize,
    saw_incomplete: AtomicUsize,
}

#[async_trait]
impl TaskHandler for Reporter {
    async fn handle(&self, task: &Task) -> Result<Outcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let job = task.job().await?;
        for id in job.find_task_ids_by_name("print:array").await? {
            if Task::load(&self.ctx, id).await?.status().await? != TaskStatus::Completed {
                self.saw_incomplete.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(Outcome::success())
    }
}

#[tokio::test]
async fn split_fans_out_and_sync_joins_once() {
    let h = harness();
    let workflow = Workflow::create(&h.ctx, "split-n-sync", &split_n_sync())
        .await
        .unwrap();
    let items: Vec<Value> = (1..=8).map(Value::from).collect();
    let job = Job::create(&h.ctx, &workflow, p(json!({"array": items})))
        .await
        .unwrap();

    let array_rule = PayloadRules::new().field("array", FieldRule::new().presence().kind(ValueKind::Array));
    let splitter = Arc::new(
        SplitWorker::new(
            &h.ctx,
            WorkerOptions::default().rules(array_rule.clone()),
            SplitOptions::new(3, "array"),
        )
        .unwrap(),
    );
    let printer_worker = Arc::new(Worker::new(&h.ctx, WorkerOptions::default().rules(array_rule)).unwrap());
    let syncer = Arc::new(SyncWorker::new(&h.ctx, WorkerOptions::default()).unwrap());
    let printer = Arc::new(Printer::default());
    let reporter = Arc::new(Reporter {
        ctx: h.ctx.clone(),
        runs: AtomicUsize::new(0),
        saw_incomplete: AtomicUsize::new(0),
    });

    // sync worker を先に動かし、print が終わる前に report を見せる
    let running = vec![
        spawn({
            let syncer = Arc::clone(&syncer);
            let reporter = Arc::clone(&reporter);
            async move { syncer.work_with("report-success", &reporter, true).await }
        }),
        spawn({
            let splitter = Arc::clone(&splitter);
            async move { splitter.work("split-array", true).await }
        }),
        spawn({
            let worker = Arc::clone(&printer_worker);
            let printer = Arc::clone(&printer);
            async move { worker.work("print-array", &printer, true).await }
        }),
    ];

    job.start().await.unwrap();
    // split 1 + print 3 + report 1
    wait_until_settled(&job, 5).await;

    for token in [
        syncer.worker().shutdown_token(),
        splitter.worker().shutdown_token(),
        printer_worker.shutdown_token(),
    ] {
        token.cancel();
    }
    for handle in running {
        handle.await.unwrap().unwrap();
    }

    let counts = job.task_status_counts().await.unwrap();
    assert_eq!(counts.completed, 5);

    let mut printed = printer.printed.lock().unwrap().clone();
    printed.sort_by_key(|v| v.as_i64());
    assert_eq!(printed, (1..=8).map(Value::from).collect::<Vec<_>>());

    assert_eq!(reporter.runs.load(Ordering::SeqCst), 1);
    assert_eq!(reporter.saw_incomplete.load(Ordering::SeqCst), 0);

    let report_id = job.find_task_ids_by_name("report:success").await.unwrap()[0];
    let report = Task::load(&h.ctx, report_id).await.unwrap();
    assert_eq!(report.payload()["nr_tasks"], json!(3));
    assert_eq!(syncer.worker().processed_tasks(), 1);
    assert_eq!(printer_worker.processed_tasks(), 3);
}

#[tokio::test]
async fn invalid_payload_stops_before_split() {
    let h = harness();
    let workflow = Workflow::create(&h.ctx, "split-n-sync", &split_n_sync())
        .await
        .unwrap();
    let job = Job::create(&h.ctx, &workflow, p(json!({"array": "not a list"})))
        .await
        .unwrap();
    job.start().await.unwrap();

    let rules = PayloadRules::new().field("array", FieldRule::new().kind(ValueKind::Array));
    let splitter = SplitWorker::new(&h.ctx, WorkerOptions::default().rules(rules), SplitOptions::new(3, "array"))
        .unwrap();
    splitter.work("split-array", false).await.unwrap();

    let counts = job.task_status_counts().await.unwrap();
    assert_eq!((counts.total(), counts.invalid_payload), (1, 1));
    assert_eq!(h.queue.in_flight("split-array").await, 0);
}
