//! Impls - ports のインメモリ実装（開発用・テスト用）
//!
//! 本番用のキュー/store は別クレートで ports の trait を実装します。

pub mod inmem_delivery;
pub mod inmem_store;

pub use self::inmem_delivery::InMemoryDeliveryQueue;
pub use self::inmem_store::InMemoryStateStore;
