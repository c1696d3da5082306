//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。キューと store は差し替え可能な
//! 外部コラボレーターで、ここでは契約だけを定義します。

pub mod clock;
pub mod delivery_queue;
pub mod id_generator;
pub mod state_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::delivery_queue::{DeliveryQueue, failed_queue_name};
pub use self::id_generator::UlidGenerator;
pub use self::state_store::{OnInsert, StateStore};
