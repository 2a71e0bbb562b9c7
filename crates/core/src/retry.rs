//! Bounded retry with multiplicative backoff for remote chat calls.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;
/// Delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);
/// Factor applied to the delay after every failed attempt.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;

/// How often, and how patiently, a failing operation is re-attempted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up after the first failure.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Total number of attempts, the initial one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// The wait before retry number `retry` (zero based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.initial_delay
            .mul_f64(self.backoff_factor.powi(retry as i32))
    }

    /// Runs `op` until it succeeds or the retry budget is spent.
    ///
    /// The error of the last attempt is returned once every attempt failed.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts() => return Err(e),
                Err(e) => {
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Chat call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
