//! Retry with exponential backoff and jitter
//!
//! One policy object shared by submission (queue-full retries) and status
//! polling (transient network/parse errors) instead of inline sleep loops.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Backoff policy: `base_delay * 2^attempt`, capped at `max_delay`, plus
/// up to one second of uniform jitter when enabled
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Default::default()
        }
    }

    /// Delay applied after the given zero-based attempt fails
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        if self.jitter {
            let jitter_ms = rand::rng().random_range(0..=1000);
            exp + Duration::from_millis(jitter_ms)
        } else {
            exp
        }
    }

    /// Run `op` until it succeeds, a non-retryable error occurs, or the
    /// attempt budget is exhausted; `retryable` decides which errors are
    /// worth another attempt
    pub async fn run<T, E, Op, Fut, P>(&self, mut op: Op, retryable: P) -> Result<T, E>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    debug!(attempt, "RetryPolicy::run: succeeded");
                    return Ok(value);
                }
                Err(err) if retryable(&err) && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "RetryPolicy::run: retrying after error");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!(attempt, error = %err, "RetryPolicy::run: giving up");
                    return Err(err);
                }
            }
        }
    }
}
