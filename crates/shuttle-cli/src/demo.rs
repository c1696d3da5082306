//! Bundled demo workflows, run against the configured backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use shuttle_core::app::{FieldRule, PayloadRules, ValueKind};
use shuttle_core::domain::{StatusCounts, payload};
use shuttle_core::{
    Context, Job, Outcome, ShuttleConfig, ShuttleError, SplitOptions, SplitWorker, SyncWorker,
    Task, TaskHandler, Worker, WorkerOptions, Workflow,
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Deserialize)]
struct Greeting {
    name: String,
}

struct Greeter {
    remaining_failures: AtomicU32,
}

#[async_trait]
impl TaskHandler for Greeter {
    async fn handle(&self, task: &Task) -> shuttle_core::Result<Outcome> {
        let greeting: Greeting = serde_json::from_value(Value::Object(task.payload().clone()))?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(ShuttleError::execution(format!("intentional failure (left={left})")));
        }

        println!("Hello, {}!", greeting.name);
        Ok(Outcome::success())
    }
}

pub async fn hello(config: &ShuttleConfig, name: String, fail_times: u32) -> anyhow::Result<()> {
    let ctx = Context::from_config(config)?;
    let workflow = Workflow::create(
        &ctx,
        "hello",
        &json!({
            "starts": ["say:hello"],
            "tasks": { "say:hello": { "queue": "hello" } }
        }),
    )
    .await?;
    let job = Job::create(&ctx, &workflow, object(json!({ "name": name }))?).await?;

    let rules = PayloadRules::new().field("name", FieldRule::new().presence().kind(ValueKind::String));
    let worker = Arc::new(Worker::new(
        &ctx,
        WorkerOptions::default().rules(rules).failure_queue(true),
    )?);
    let greeter = Arc::new(Greeter {
        remaining_failures: AtomicU32::new(fail_times),
    });
    let running = spawn({
        let worker = Arc::clone(&worker);
        async move { worker.work("hello", &greeter, true).await }
    });

    job.start().await?;
    let counts = wait_until_settled(&job, 1).await?;

    worker.shutdown();
    running.await??;
    summarize(&job, counts)
}

struct Printer;

#[async_trait]
impl TaskHandler for Printer {
    async fn handle(&self, task: &Task) -> shuttle_core::Result<Outcome> {
        if let Some(Value::Array(items)) = task.payload().get("array") {
            for (i, item) in items.iter().enumerate() {
                info!(task_id = %task.id(), "{}. {item}", i + 1);
            }
        }
        Ok(Outcome::success())
    }
}

struct Reporter;

#[async_trait]
impl TaskHandler for Reporter {
    async fn handle(&self, task: &Task) -> shuttle_core::Result<Outcome> {
        let slices = task.payload().get("nr_tasks").cloned().unwrap_or(Value::Null);
        println!("all {slices} slices printed");
        Ok(Outcome::success())
    }
}

pub async fn split_sync(config: &ShuttleConfig, items: usize, slice_size: usize) -> anyhow::Result<()> {
    let ctx = Context::from_config(config)?;
    let workflow = Workflow::create(
        &ctx,
        "split-n-sync",
        &json!({
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
        }),
    )
    .await?;
    let array: Vec<Value> = (1..=items).map(Value::from).collect();
    let job = Job::create(&ctx, &workflow, object(json!({ "array": array }))?).await?;

    let array_rule = PayloadRules::new().field("array", FieldRule::new().presence().kind(ValueKind::Array));
    let splitter = Arc::new(SplitWorker::new(
        &ctx,
        WorkerOptions::default().rules(array_rule.clone()),
        SplitOptions::new(slice_size, "array"),
    )?);
    let printer = Arc::new(Worker::new(&ctx, WorkerOptions::default().rules(array_rule))?);
    let syncer = Arc::new(SyncWorker::new(&ctx, WorkerOptions::default())?);

    let running = vec![
        spawn({
            let splitter = Arc::clone(&splitter);
            async move { splitter.work("split-array", true).await }
        }),
        spawn({
            let printer = Arc::clone(&printer);
            async move { printer.work("print-array", &Printer, true).await }
        }),
        spawn({
            let syncer = Arc::clone(&syncer);
            async move { syncer.work_with("report-success", &Reporter, true).await }
        }),
    ];

    job.start().await?;
    // split 1 + slices + report 1
    let expected = 2 + items.div_ceil(slice_size.max(1));
    let counts = wait_until_settled(&job, expected).await?;

    splitter.worker().shutdown();
    printer.shutdown();
    syncer.worker().shutdown();
    for handle in running {
        handle.await??;
    }
    summarize(&job, counts)
}

fn object(value: Value) -> anyhow::Result<shuttle_core::domain::Payload> {
    payload::from_value(value).context("payload must be a JSON object")
}

fn spawn<F>(work: F) -> JoinHandle<shuttle_core::Result<()>>
where
    F: std::future::Future<Output = shuttle_core::Result<()>> + Send + 'static,
{
    tokio::spawn(work)
}

/// Polls until `expected` tasks exist and none is queued or working, or Ctrl-C.
async fn wait_until_settled(job: &Job, expected: usize) -> anyhow::Result<StatusCounts> {
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        let counts = job.task_status_counts().await?;
        if counts.total() >= expected && counts.queued + counts.working == 0 {
            return Ok(counts);
        }
        tokio::select! {
            _ = &mut interrupted => {
                warn!(job = %job.id(), "interrupted before the job settled");
                return Ok(counts);
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

fn summarize(job: &Job, counts: StatusCounts) -> anyhow::Result<()> {
    info!(job = %job.id(), total = counts.total(), "job settled");
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}
