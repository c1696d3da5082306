//! Backoff policy for fetch retries.

use std::time::Duration;

/// Exponential backoff: delay = base_delay * multiplier^(attempt - 1), capped at `max_delay`
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// 1回の iteration で許すリトライ回数
    pub max_retries: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

impl Backoff {
    /// `attempt` is 1-indexed; 0 is treated like 1.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        // 桁あふれ・NaN は上限に丸める
        Duration::try_from_secs_f64(base_secs * self.multiplier.powi(exponent))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
