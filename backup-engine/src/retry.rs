//! Bounded exponential backoff around remote operations.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;

/// Errors that know whether trying again can help.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_secs(config.base_delay_secs))
    }

    /// Delay slept before retry number `retry` (1-based): base, 2×base, 4×base, ...
    pub fn delay_for(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << shift)
    }

    /// Every delay the policy can sleep during one operation.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|r| self.delay_for(r)).collect()
    }

    /// Run `op` until it succeeds, fails with a non-transient error, runs out
    /// of attempts, or `cancel` fires during a backoff sleep. The closure gets
    /// the 1-based attempt number. The last error is returned on failure.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 1;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                warn!(
                    "{} failed after {} attempts, giving up: {}",
                    operation, attempt, err
                );
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            warn!(
                "{} failed (attempt {}/{}), retrying in {}s: {}",
                operation,
                attempt,
                self.max_attempts,
                delay.as_secs_f64(),
                err
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(err),
            }
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(2))
    }
}
