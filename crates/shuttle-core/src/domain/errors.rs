//! Errors - エラー型と分類
//!
//! 分類:
//! - 入力/設定エラー: 呼び出し元へ即座に返す（リトライしない）
//! - not-found: lookup のキーと値を保持する
//! - lease の誤用: `LockAlreadyAcquired` / `LockNotAcquired`
//!   （ロックが取れないこと自体はエラーではなく `false`）
//! - 配送エラー: `MessageNotReceived` / `CouldNotFetchTask`
//! - payload 検証エラー: フィールドごとの失敗を全部持つ
//!
//! sync の「まだ揃っていない」はエラーではありません。
//! [`Outcome::Blocked`](crate::domain::Outcome) を見てください。

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::ids::{JobId, MessageId, TaskId};

pub type Result<T, E = ShuttleError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ShuttleError {
    #[error("invalid task attributes: {0}")]
    InvalidTaskAttributes(String),

    #[error("invalid queue name: {0:?}")]
    InvalidQueueName(String),

    #[error("invalid workflow descriptor: {}", .0.join("; "))]
    InvalidDescriptor(Vec<String>),

    #[error("workflow {0:?} already exists")]
    DuplicateWorkflow(String),

    #[error("workflow not found ({key} = {value})")]
    WorkflowNotFound { key: &'static str, value: String },

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("lock already acquired for {0}")]
    LockAlreadyAcquired(TaskId),

    #[error("lock not acquired for {0}")]
    LockNotAcquired(TaskId),

    #[error("no message received for {0}")]
    MessageNotReceived(TaskId),

    #[error("could not fetch task from {queue_name:?} (message: {message_id:?}, task: {task_id:?}): {source}")]
    CouldNotFetchTask {
        queue_name: String,
        message_id: Option<MessageId>,
        task_id: Option<TaskId>,
        #[source]
        source: Box<ShuttleError>,
    },

    #[error("payload validation failed: {0}")]
    PayloadValidation(ValidationErrors),

    #[error("missing split parameter: {0}")]
    MissingSplitParameters(&'static str),

    #[error("invalid worker configuration: {name} = {value}")]
    InvalidWorkerConfiguration { name: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("task execution failed: {0}")]
    Execution(String),

    #[error("task execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("store error: {0}")]
    Store(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl ShuttleError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// 根本原因が「task の行が store に無い」かどうか
    pub fn is_missing_task(&self) -> bool {
        match self {
            Self::TaskNotFound(_) => true,
            Self::CouldNotFetchTask { source, .. } => source.is_missing_task(),
            _ => false,
        }
    }
}

/// One failed field/option pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldFailure {
    pub expected: String,
    pub got: String,
}

/// Payload validation result keyed by `"<field>.<option>"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, FieldFailure>);

impl ValidationErrors {
    pub fn add(
        &mut self,
        field: &str,
        option: &str,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) {
        self.0.insert(
            format!("{field}.{option}"),
            FieldFailure {
                expected: expected.into(),
                got: got.into(),
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &str) -> Option<&FieldFailure> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, failure) in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{key} (expected {}, got {})", failure.expected, failure.got)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn missing_task_is_detected_through_fetch_wrapper() {
        let task_id = TaskId::from_ulid(Ulid::new());
        let err = ShuttleError::CouldNotFetchTask {
            queue_name: "q".into(),
            message_id: None,
            task_id: Some(task_id),
            source: Box::new(ShuttleError::TaskNotFound(task_id)),
        };
        assert!(err.is_missing_task());

        let err = ShuttleError::CouldNotFetchTask {
            queue_name: "q".into(),
            message_id: None,
            task_id: None,
            source: Box::new(ShuttleError::Queue("down".into())),
        };
        assert!(!err.is_missing_task());
    }

    #[test]
    fn validation_errors_render_every_failure() {
        let mut errors = ValidationErrors::default();
        errors.add("name", "presence", "present", "absent");
        errors.add("age", "type", "integer", "string");

        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors.to_string(),
            "age.type (expected integer, got string), name.presence (expected present, got absent)"
        );
    }
}
