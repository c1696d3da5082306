//! Configuration loaded from TOML.
//!
//! ```toml
//! [queue]
//! backend = "memory"
//! redelivery_after_secs = 5.0
//!
//! [store]
//! backend = "memory"
//! lease_period_secs = 60.0
//!
//! [log]
//! filter = "shuttle_core=info,shuttle_cli=info"
//! ```
//!
//! すべてのセクションとフィールドは省略可能です。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{Result, ShuttleError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShuttleConfig {
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    #[default]
    Memory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// ack されない配送を再配送するまでの秒数
    pub redelivery_after_secs: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            redelivery_after_secs: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub lease_period_secs: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            lease_period_secs: 60.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `RUST_LOG` が無いときに使う EnvFilter 文字列
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "shuttle_core=info,shuttle_cli=info".to_string(),
        }
    }
}

impl ShuttleConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ShuttleError::InvalidConfiguration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ShuttleError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        positive("store.lease_period_secs", self.store.lease_period_secs)?;
        positive("queue.redelivery_after_secs", self.queue.redelivery_after_secs)?;
        Ok(())
    }

    pub fn lease_period(&self) -> Duration {
        Duration::from_secs_f64(self.store.lease_period_secs)
    }

    pub fn redelivery_after(&self) -> Duration {
        Duration::from_secs_f64(self.queue.redelivery_after_secs)
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    // 上限は Duration::from_secs_f64 が panic しない範囲
    if value.is_finite() && value > 0.0 && value < 1e12 {
        Ok(())
    } else {
        Err(ShuttleError::InvalidConfiguration(format!(
            "{name} must be a positive number of seconds, got {value}"
        )))
    }
}
