//! Retry strategy for transient database failures
//!
//! Busy and locked SQLite errors are expected under concurrent writers and
//! are retried in a tight exponential loop. Every other error is returned
//! to the caller on the first occurrence.

use crate::config::RetrySettings;
use crate::error::{NodeError, Result};
use crate::metrics;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Exponential retry policy applied to transient errors only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryStrategy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for the delay between retries
    pub max_delay: Duration,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryStrategy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl RetryStrategy {
    /// A strategy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after the given (zero-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn should_retry(&self, attempt: u32, err: &NodeError) -> bool {
        err.is_transient() && attempt + 1 < self.max_attempts
    }

    /// Run a synchronous operation, retrying transient failures
    pub async fn run<F, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(attempt, &e) => {
                    self.backoff(attempt, &e).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run an asynchronous operation, retrying transient failures
    pub async fn run_async<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(attempt, &e) => {
                    self.backoff(attempt, &e).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn backoff(&self, attempt: u32, err: &NodeError) {
        let delay = self.delay_for(attempt);
        debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "Retrying transient failure");
        metrics::record_txn_retry(err.error_type());
        tokio::time::sleep(delay).await;
    }
}
