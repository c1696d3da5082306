//! SplitWorker - コレクションを slice に分けて子 task を作る（fan-out）
//!
//! 分ける対象は `payload[payload_key]`、または [`Splitter`] が返すコレクション。
//! slice ごとに、親 task type の `starts_parallel` / `starts_manually` に並ぶ
//! 型の task を1つずつ作ります。子の payload は親の payload の `payload_key`
//! を slice で置き換えたもので、`parent_task_id` は親の id です。
//! この兄弟グループを後で SyncWorker が数えます。

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::Value;
use tracing::debug;

use super::builder::Context;
use super::handler::TaskHandler;
use super::task::Task;
use super::worker::{Worker, WorkerOptions};
use crate::domain::{Outcome, Result, ShuttleError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitOptions {
    pub slice_size: Option<usize>,
    /// Key holding the collection, and the key each child receives its slice under.
    pub payload_key: Option<String>,
    /// 子には slice の代わりに slice からランダムに選んだ1要素を渡す
    pub sample: bool,
}

impl SplitOptions {
    pub fn new(slice_size: usize, payload_key: impl Into<String>) -> Self {
        Self {
            slice_size: Some(slice_size),
            payload_key: Some(payload_key.into()),
            sample: false,
        }
    }

    pub fn sample(mut self, sample: bool) -> Self {
        self.sample = sample;
        self
    }
}

/// Produces the collection to split when it does not come straight from the payload.
#[async_trait]
pub trait Splitter: Send + Sync {
    async fn splittable(&self, task: &Task) -> Result<Vec<Value>>;
}

/// Reads the collection from `payload[key]`.
#[derive(Debug, Clone)]
pub struct PayloadSplitter {
    key: String,
}

#[async_trait]
impl Splitter for PayloadSplitter {
    async fn splittable(&self, task: &Task) -> Result<Vec<Value>> {
        match task.payload().get(&self.key) {
            Some(Value::Array(items)) => Ok(items.clone()),
            other => Err(ShuttleError::InvalidTaskAttributes(format!(
                "payload key {:?} must hold an array, got {}",
                self.key,
                other.map_or("nothing", |_| "another type")
            ))),
        }
    }
}

#[derive(Debug)]
pub struct SplitWorker {
    worker: Worker,
    slice_size: usize,
    payload_key: String,
    sample: bool,
}

impl SplitWorker {
    pub fn new(ctx: &Context, options: WorkerOptions, split: SplitOptions) -> Result<Self> {
        let payload_key = split
            .payload_key
            .ok_or(ShuttleError::MissingSplitParameters("payload_key"))?;
        let slice_size = split
            .slice_size
            .ok_or(ShuttleError::MissingSplitParameters("slice_size"))?;
        if slice_size == 0 {
            return Err(ShuttleError::InvalidWorkerConfiguration {
                name: "slice_size",
                value: "0".into(),
            });
        }
        if payload_key.is_empty() {
            return Err(ShuttleError::InvalidWorkerConfiguration {
                name: "payload_key",
                value: String::new(),
            });
        }

        Ok(Self {
            worker: Worker::new(ctx, options)?,
            slice_size,
            payload_key,
            sample: split.sample,
        })
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Splits `payload[payload_key]` of every task fetched from `queue_name`.
    pub async fn work(&self, queue_name: &str, blocking: bool) -> Result<()> {
        let splitter = PayloadSplitter {
            key: self.payload_key.clone(),
        };
        self.work_with(queue_name, &splitter, blocking).await
    }

    /// Splits whatever `splitter` returns for each task.
    pub async fn work_with<S>(&self, queue_name: &str, splitter: &S, blocking: bool) -> Result<()>
    where
        S: Splitter + ?Sized,
    {
        let handler = SplitHandler {
            splitter,
            slice_size: self.slice_size,
            payload_key: &self.payload_key,
            sample: self.sample,
        };
        self.worker.work(queue_name, &handler, blocking).await
    }
}

struct SplitHandler<'a, S: ?Sized> {
    splitter: &'a S,
    slice_size: usize,
    payload_key: &'a str,
    sample: bool,
}

#[async_trait]
impl<S> TaskHandler for SplitHandler<'_, S>
where
    S: Splitter + ?Sized,
{
    async fn handle(&self, task: &Task) -> Result<Outcome> {
        let items = self.splitter.splittable(task).await?;
        let job = task.job().await?;
        let targets = job.task_spec(task.name())?.split_targets();

        let mut created = 0;
        for slice in items.chunks(self.slice_size) {
            let mut payload = task.payload().clone();
            payload.insert(self.payload_key.to_string(), slice_value(slice, self.sample));
            for target in &targets {
                job.create_task(Some(task.id()), target, &payload).await?;
                created += 1;
            }
        }

        debug!(
            task_id = %task.id(),
            items = items.len(),
            slice_size = self.slice_size,
            created,
            "split finished"
        );
        Ok(Outcome::success())
    }
}

fn slice_value(slice: &[Value], sample: bool) -> Value {
    if sample {
        slice
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or(Value::Null)
    } else {
        Value::Array(slice.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::job::Job;
    use crate::app::workflow::Workflow;
    use crate::domain::descriptor::fixtures;
    use crate::domain::{TaskStatus, payload};
    use crate::impls::{InMemoryDeliveryQueue, InMemoryStateStore};
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Arc;

    struct Harness {
        ctx: Context,
        queue: Arc<InMemoryDeliveryQueue>,
        job: Job,
    }

    async fn harness(payload: Value) -> Harness {
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let ctx = Context::builder()
            .queue(queue.clone())
            .store(Arc::new(InMemoryStateStore::new()))
            .build()
            .unwrap();
        let workflow = Workflow::create(&ctx, "split", &fixtures::split_n_sync())
            .await
            .unwrap();
        let job = Job::create(&ctx, &workflow, payload::from_value(payload).unwrap())
            .await
            .unwrap();
        job.start().await.unwrap();
        Harness { ctx, queue, job }
    }

    async fn payloads_of(h: &Harness, name: &str) -> Vec<Value> {
        let mut out = Vec::new();
        for id in h.job.find_task_ids_by_name(name).await.unwrap() {
            let task = Task::load(&h.ctx, id).await.unwrap();
            out.push(Value::Object(task.payload().clone()));
        }
        out
    }

    #[tokio::test]
    async fn splits_payload_into_slices_under_the_parent() {
        let h = harness(json!({"array": [1, 2, 3, 4, 5, 6, 7], "tag": "t"})).await;
        let worker = SplitWorker::new(&h.ctx, WorkerOptions::default(), SplitOptions::new(3, "array")).unwrap();

        worker.work("split-array", false).await.unwrap();

        assert_eq!(
            payloads_of(&h, "print:array").await,
            vec![
                json!({"array": [1, 2, 3], "tag": "t"}),
                json!({"array": [4, 5, 6], "tag": "t"}),
                json!({"array": [7], "tag": "t"}),
            ]
        );
        let split_id = h.job.find_task_ids_by_name("split:array").await.unwrap()[0];
        for id in h.job.find_task_ids_by_name("print:array").await.unwrap() {
            let print = Task::load(&h.ctx, id).await.unwrap();
            assert_eq!(print.parent_task_id(), Some(split_id));
        }
        assert_eq!(h.queue.len("print-array").await, 3);

        let split = Task::load(&h.ctx, split_id).await.unwrap();
        assert_eq!(split.status().await.unwrap(), TaskStatus::Completed);
        assert_eq!(payloads_of(&h, "report:success").await[0]["nr_tasks"], json!(3));
    }

    struct Fixed(Vec<Value>);

    #[async_trait]
    impl Splitter for Fixed {
        async fn splittable(&self, _task: &Task) -> Result<Vec<Value>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn splitter_supplies_the_collection() {
        let h = harness(json!({})).await;
        let worker = SplitWorker::new(&h.ctx, WorkerOptions::default(), SplitOptions::new(2, "array")).unwrap();

        worker
            .work_with("split-array", &Fixed(vec![json!("a"), json!("b"), json!("c")]), false)
            .await
            .unwrap();

        assert_eq!(
            payloads_of(&h, "print:array").await,
            vec![json!({"array": ["a", "b"]}), json!({"array": ["c"]})]
        );
    }

    #[tokio::test]
    async fn sample_passes_one_element_per_slice() {
        let h = harness(json!({"array": [1, 2, 3, 4]})).await;
        let options = SplitOptions::new(2, "array").sample(true);
        let worker = SplitWorker::new(&h.ctx, WorkerOptions::default(), options).unwrap();

        worker.work("split-array", false).await.unwrap();

        let picked = payloads_of(&h, "print:array").await;
        assert_eq!(picked.len(), 2);
        assert!([json!(1), json!(2)].contains(&picked[0]["array"]));
        assert!([json!(3), json!(4)].contains(&picked[1]["array"]));
    }

    #[tokio::test]
    async fn non_array_payload_fails_the_task() {
        let h = harness(json!({"array": "nope"})).await;
        let worker = SplitWorker::new(&h.ctx, WorkerOptions::default(), SplitOptions::new(2, "array")).unwrap();

        worker.work("split-array", false).await.unwrap();

        assert!(payloads_of(&h, "print:array").await.is_empty());
        let split_id = h.job.find_task_ids_by_name("split:array").await.unwrap()[0];
        let split = Task::load(&h.ctx, split_id).await.unwrap();
        assert_eq!(split.status().await.unwrap(), TaskStatus::Queued);
    }

    #[rstest]
    #[case::no_key(SplitOptions { slice_size: Some(2), ..Default::default() }, "payload_key")]
    #[case::no_size(SplitOptions { payload_key: Some("array".into()), ..Default::default() }, "slice_size")]
    fn missing_parameters_fail_fast(#[case] options: SplitOptions, #[case] missing: &str) {
        let ctx = Context::in_memory();
        match SplitWorker::new(&ctx, WorkerOptions::default(), options) {
            Err(ShuttleError::MissingSplitParameters(name)) => assert_eq!(name, missing),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn zero_slice_size_is_rejected() {
        let ctx = Context::in_memory();
        assert!(matches!(
            SplitWorker::new(&ctx, WorkerOptions::default(), SplitOptions::new(0, "array")),
            Err(ShuttleError::InvalidWorkerConfiguration { name: "slice_size", .. })
        ));
    }
}
