//! Exponential backoff for transport retries.
//!
//! Only `ChannelUnavailable` is retried here. Lifecycle and upload errors are
//! returned to the caller on the first attempt.

use crate::config::RetryConfig;
use crate::domain::{RelayError, RelayResult};
use std::future::Future;
use std::time::Duration;

/// Maximum attempts when no config is given.
pub const MAX_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff (milliseconds).
pub const BASE_DELAY_MS: u64 = 100;

/// Backoff schedule: `base * 2^(attempt-1)` with +/-25% jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: Duration::from_millis(BASE_DELAY_MS),
            jitter: true,
        }
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay_ms = self.base_delay.as_millis() as u64 * (1u64 << exponent);
        if !self.jitter {
            return Duration::from_millis(delay_ms);
        }
        let jitter = (delay_ms as f64 * 0.25 * (rand::random::<f64>() * 2.0 - 1.0)) as i64;
        Duration::from_millis((delay_ms as i64 + jitter).max(10) as u64)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. The last error is returned.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> RelayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    tracing::debug!(what, attempt, ?delay, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::warn!(what, attempts = attempt, error = %e, "retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Maps a transport failure into the retryable error kind.
pub fn transport_error(e: impl std::fmt::Display) -> RelayError {
    RelayError::channel(e.to_string())
}
