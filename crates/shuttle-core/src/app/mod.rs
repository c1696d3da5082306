//! App - アプリケーション層
//!
//! ports を組み合わせて workflow / job / task / worker を実装します。
//!
//! # 主要コンポーネント
//! - **Context**: queue / store / clock の束（グローバル状態の代わりに明示的に渡す）
//! - **Workflow / Job / Task**: 永続化されたエンティティの操作
//! - **Worker**: 1キューのポーリングループ（fetch → validate → lock → execute → conclude）
//! - **SplitWorker / SyncWorker**: fan-out と fan-in

pub mod backoff;
pub mod builder;
pub mod handler;
pub mod hooks;
pub mod job;
pub mod split;
pub mod sync;
pub mod task;
pub mod validation;
pub mod worker;
pub mod workflow;

pub use self::backoff::Backoff;
pub use self::builder::{Context, ContextBuilder};
pub use self::handler::{NoopHandler, TaskHandler};
pub use self::hooks::{NoHooks, WorkerHooks};
pub use self::job::{Job, NextTasks};
pub use self::split::{PayloadSplitter, SplitOptions, SplitWorker, Splitter};
pub use self::sync::SyncWorker;
pub use self::task::Task;
pub use self::validation::{FieldRule, PayloadRules, ValueKind};
pub use self::worker::{Worker, WorkerOptions};
pub use self::workflow::{Workflow, WorkflowRef};
