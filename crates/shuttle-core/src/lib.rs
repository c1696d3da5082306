//! shuttle-core
//!
//! DAG 型の workflow を、キューと store の上で分散実行するためのコア。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, descriptor, validator, records, state, outcome, errors）
//! - **ports**: 抽象化レイヤー（DeliveryQueue, StateStore, Clock, UlidGenerator）
//! - **impls**: ports のインメモリ実装
//! - **app**: Context, Workflow, Job, Task, Worker, SplitWorker, SyncWorker
//! - **config**: TOML 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use self::app::{
    Context, Job, SplitOptions, SplitWorker, SyncWorker, Task, TaskHandler, Worker, WorkerOptions,
    Workflow,
};
pub use self::config::ShuttleConfig;
pub use self::domain::{Outcome, Result, ShuttleError};
