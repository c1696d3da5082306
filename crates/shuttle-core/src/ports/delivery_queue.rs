//! DeliveryQueue port - 配送キュー
//!
//! キューは task_id だけを運びます（状態や payload は StateStore が正本）。
//!
//! # 契約
//! - at-least-once: ack されない配送は実装依存の時間が経つと再配送される
//! - `fetch_next` は配送が来るまで待つ
//! - 失敗用キューの名前は `<queue>-failed`

use async_trait::async_trait;

use crate::domain::{Delivery, MessageId, Result, TaskId};

pub fn failed_queue_name(queue_name: &str) -> String {
    format!("{queue_name}-failed")
}

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    async fn enqueue(&self, queue_name: &str, task_id: TaskId) -> Result<()>;

    async fn enqueue_to_failed(&self, queue_name: &str, task_id: TaskId) -> Result<()> {
        self.enqueue(&failed_queue_name(queue_name), task_id).await
    }

    async fn fetch_next(&self, queue_name: &str) -> Result<Delivery>;

    /// 配送を完全に取り除く（以後再配送されない）
    async fn acknowledge(&self, queue_name: &str, message_id: MessageId) -> Result<()>;
}
