//! Context と ContextBuilder - 依存のワイヤリング
//!
//! キュー・store・時計を1つの `Context` にまとめ、Workflow/Job/Task/Worker に
//! 明示的に渡します（グローバルな状態は持たない）。
//!
//! # Fail-fast 設計
//! - `build()` 時に必須の依存と lease 期間を検証する
//! - 足りなければ `InvalidConfiguration` を返す

use std::sync::Arc;
use std::time::Duration;

use crate::config::{QueueBackend, ShuttleConfig, StoreBackend};
use crate::domain::{Result, ShuttleError};
use crate::impls::{InMemoryDeliveryQueue, InMemoryStateStore};
use crate::ports::{Clock, DeliveryQueue, StateStore, SystemClock, UlidGenerator};

pub const DEFAULT_LEASE_PERIOD: Duration = Duration::from_secs(60);

/// Shared handles to the queue and store collaborators.
#[derive(Clone)]
pub struct Context {
    queue: Arc<dyn DeliveryQueue>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator,
    lease_period: Duration,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// In-memory queue and store on the system clock.
    pub fn in_memory() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            queue: Arc::new(InMemoryDeliveryQueue::new()),
            store: Arc::new(InMemoryStateStore::with_clock(Arc::clone(&clock))),
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
            lease_period: DEFAULT_LEASE_PERIOD,
        }
    }

    /// 設定のバックエンド選択に従って組み立てる
    pub fn from_config(config: &ShuttleConfig) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let queue: Arc<dyn DeliveryQueue> = match config.queue.backend {
            QueueBackend::Memory => Arc::new(InMemoryDeliveryQueue::with_clock(
                config.redelivery_after(),
                Arc::clone(&clock),
            )),
        };
        let store: Arc<dyn StateStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(InMemoryStateStore::with_clock(Arc::clone(&clock))),
        };
        ContextBuilder::new()
            .queue(queue)
            .store(store)
            .clock(clock)
            .lease_period(config.lease_period())
            .build()
    }

    pub fn queue(&self) -> &dyn DeliveryQueue {
        self.queue.as_ref()
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn ids(&self) -> &UlidGenerator {
        &self.ids
    }

    pub fn lease_period(&self) -> Duration {
        self.lease_period
    }

    pub(crate) fn store_handle(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    pub(crate) fn clock_handle(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("lease_period", &self.lease_period)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ContextBuilder {
    queue: Option<Arc<dyn DeliveryQueue>>,
    store: Option<Arc<dyn StateStore>>,
    clock: Option<Arc<dyn Clock>>,
    lease_period: Option<Duration>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: Arc<dyn DeliveryQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn lease_period(mut self, period: Duration) -> Self {
        self.lease_period = Some(period);
        self
    }

    pub fn build(self) -> Result<Context> {
        let queue = self
            .queue
            .ok_or_else(|| ShuttleError::InvalidConfiguration("queue is not set".into()))?;
        let store = self
            .store
            .ok_or_else(|| ShuttleError::InvalidConfiguration("store is not set".into()))?;
        let lease_period = self.lease_period.unwrap_or(DEFAULT_LEASE_PERIOD);
        if lease_period.is_zero() {
            return Err(ShuttleError::InvalidConfiguration(
                "lease period must be positive".into(),
            ));
        }
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        Ok(Context {
            queue,
            store,
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
            lease_period,
        })
    }
}
