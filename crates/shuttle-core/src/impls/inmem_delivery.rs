//! InMemoryDeliveryQueue - 開発用の配送キュー
//!
//! # 実装詳細
//! - queue 名ごとの `VecDeque<TaskId>` を tokio の Mutex で守る
//! - fetch した配送は in-flight として保持し、ack されないまま
//!   `redeliver_after` が過ぎたら元のキューの末尾に戻す（at-least-once）
//! - 再配送の期限は min-heap で管理し、fetch のたびに期限切れを昇格させる
//! - 待機中の fetch は `Notify` と次の再配送期限の早い方で起きる

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{Delivery, MessageId, Result, TaskId};
use crate::ports::{Clock, DeliveryQueue, SystemClock, UlidGenerator};

pub const DEFAULT_REDELIVER_AFTER: Duration = Duration::from_secs(5);

/// Redelivery deadline of one in-flight message.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct RedeliveryDue {
    due_at: Instant,
    message_id: MessageId,
}

impl PartialOrd for RedeliveryDue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RedeliveryDue {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.message_id.cmp(&self.message_id))
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    queue_name: String,
    task_id: TaskId,
}

#[derive(Default)]
struct QueueState {
    ready: HashMap<String, VecDeque<TaskId>>,
    in_flight: HashMap<MessageId, InFlight>,
    redelivery: BinaryHeap<RedeliveryDue>,
}

impl QueueState {
    /// 期限が来た in-flight 配送をキューへ戻す
    fn promote_expired(&mut self, now: Instant) {
        while let Some(entry) = self.redelivery.peek() {
            if entry.due_at > now {
                break;
            }
            let Some(entry) = self.redelivery.pop() else {
                break;
            };
            // ack 済みならもう in_flight に居ない
            if let Some(in_flight) = self.in_flight.remove(&entry.message_id) {
                debug!(
                    queue = %in_flight.queue_name,
                    task_id = %in_flight.task_id,
                    "redelivering unacknowledged message"
                );
                self.ready
                    .entry(in_flight.queue_name)
                    .or_default()
                    .push_back(in_flight.task_id);
            }
        }
    }
}

pub struct InMemoryDeliveryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    ids: UlidGenerator,
    redeliver_after: Duration,
}

impl InMemoryDeliveryQueue {
    pub fn new() -> Self {
        Self::with_redelivery(DEFAULT_REDELIVER_AFTER)
    }

    pub fn with_redelivery(redeliver_after: Duration) -> Self {
        Self::with_clock(redeliver_after, Arc::new(SystemClock))
    }

    pub fn with_clock(redeliver_after: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            ids: UlidGenerator::new(clock),
            redeliver_after,
        }
    }

    /// Messages waiting to be fetched on `queue_name`.
    pub async fn len(&self, queue_name: &str) -> usize {
        let state = self.state.lock().await;
        state.ready.get(queue_name).map_or(0, VecDeque::len)
    }

    pub async fn is_empty(&self, queue_name: &str) -> bool {
        self.len(queue_name).await == 0
    }

    /// Fetched but not yet acknowledged messages on `queue_name`.
    pub async fn in_flight(&self, queue_name: &str) -> usize {
        let state = self.state.lock().await;
        state
            .in_flight
            .values()
            .filter(|m| m.queue_name == queue_name)
            .count()
    }

    /// Task ids waiting on `queue_name`, front first.
    pub async fn peek_all(&self, queue_name: &str) -> Vec<TaskId> {
        let state = self.state.lock().await;
        state
            .ready
            .get(queue_name)
            .map(|q| q.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn queues(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.ready.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for InMemoryDeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn enqueue(&self, queue_name: &str, task_id: TaskId) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state
                .ready
                .entry(queue_name.to_string())
                .or_default()
                .push_back(task_id);
        }
        // ロックの外で通知する
        self.notify.notify_waiters();
        Ok(())
    }

    async fn fetch_next(&self, queue_name: &str) -> Result<Delivery> {
        loop {
            // 状態を見る前に登録しておき、直後の enqueue を取りこぼさない
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.promote_expired(now);

                if let Some(task_id) = state.ready.get_mut(queue_name).and_then(VecDeque::pop_front)
                {
                    let message_id: MessageId = self.ids.next();
                    state.in_flight.insert(
                        message_id,
                        InFlight {
                            queue_name: queue_name.to_string(),
                            task_id,
                        },
                    );
                    state.redelivery.push(RedeliveryDue {
                        due_at: now + self.redeliver_after,
                        message_id,
                    });
                    return Ok(Delivery {
                        id: message_id,
                        task_id,
                    });
                }

                state.redelivery.peek().map(|entry| entry.due_at)
            };

            match next_wake {
                Some(wake_at) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = tokio::time::sleep_until(wake_at) => {},
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn acknowledge(&self, _queue_name: &str, message_id: MessageId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.in_flight.remove(&message_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn task_id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn enqueue_then_fetch_is_fifo_per_queue() {
        let queue = InMemoryDeliveryQueue::new();
        let (a, b, c) = (task_id(), task_id(), task_id());
        queue.enqueue("q1", a).await.unwrap();
        queue.enqueue("q2", b).await.unwrap();
        queue.enqueue("q1", c).await.unwrap();

        assert_eq!(queue.fetch_next("q1").await.unwrap().task_id, a);
        assert_eq!(queue.fetch_next("q1").await.unwrap().task_id, c);
        assert_eq!(queue.fetch_next("q2").await.unwrap().task_id, b);
        assert_eq!(queue.in_flight("q1").await, 2);
    }

    #[tokio::test]
    async fn enqueue_wakes_waiting_fetch() {
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let id = task_id();

        let fetch = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.fetch_next("default").await.unwrap() }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.enqueue("default", id).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), fetch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.task_id, id);
    }

    #[tokio::test]
    async fn enqueue_on_other_queue_does_not_satisfy_fetch() {
        let queue = InMemoryDeliveryQueue::new();
        queue.enqueue("other", task_id()).await.unwrap();

        let result =
            tokio::time::timeout(Duration::from_millis(100), queue.fetch_next("default")).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_message_is_redelivered() {
        let queue = InMemoryDeliveryQueue::with_redelivery(Duration::from_secs(5));
        let id = task_id();
        queue.enqueue("q", id).await.unwrap();

        let first = queue.fetch_next("q").await.unwrap();
        assert!(queue.is_empty("q").await);

        // 時間を止めているので、sleep_until は自動で期限まで進む
        let second = queue.fetch_next("q").await.unwrap();
        assert_eq!(second.task_id, id);
        assert_ne!(second.id, first.id);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_message_is_not_redelivered() {
        let queue = InMemoryDeliveryQueue::with_redelivery(Duration::from_secs(5));
        queue.enqueue("q", task_id()).await.unwrap();

        let delivery = queue.fetch_next("q").await.unwrap();
        queue.acknowledge("q", delivery.id).await.unwrap();
        assert_eq!(queue.in_flight("q").await, 0);

        let result = tokio::time::timeout(Duration::from_secs(30), queue.fetch_next("q")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failed_messages_go_to_suffixed_queue() {
        let queue = InMemoryDeliveryQueue::new();
        let id = task_id();
        queue.enqueue_to_failed("print", id).await.unwrap();

        assert_eq!(queue.peek_all("print-failed").await, vec![id]);
        assert!(queue.is_empty("print").await);
    }
}
