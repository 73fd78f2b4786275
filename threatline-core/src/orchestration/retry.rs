//! Backoff policy and the retry loop wrapped around every adapter call.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::config::RetryConfig;
use crate::error::AdapterError;

/// Exponential backoff with additive jitter:
/// `delay(attempt) = min(base * 2^attempt, cap) + U[0, delay)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    base_ms: u64,
    cap_ms: u64,
    max_retries: u32,
}

impl BackoffPolicy {
    /// Policy from the configured base, cap and retry budget.
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            cap_ms: config.backoff_cap_ms,
            max_retries: config.max_retries,
        }
    }

    /// Retries allowed after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before jitter for the zero-based retry `attempt`.
    pub fn anchor_delay(&self, attempt: u32) -> Duration {
        let scaled = (self.base_ms as f64) * 2f64.powi(attempt.min(63) as i32);
        let capped = scaled.min(self.cap_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Jittered delay drawn from the thread-local RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::rng())
    }

    /// Jittered delay drawn from `rng`.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let anchor_ms = self.anchor_delay(attempt).as_millis() as u64;
        if anchor_ms == 0 {
            return Duration::ZERO;
        }
        let jitter_ms = rng.random_range(0..anchor_ms);
        Duration::from_millis(anchor_ms.saturating_add(jitter_ms))
    }
}

/// Outcome of a retried adapter call plus how many retries it took.
#[derive(Debug)]
pub(crate) struct Attempted<T> {
    pub result: Result<T, AdapterError>,
    pub retries: u32,
}

/// Runs `call` under `timeout`, retrying transient failures (timeouts
/// included) until it succeeds, fails permanently, or the retry budget is
/// spent. `on_retry` sees the one-based retry number before each backoff.
pub(crate) async fn call_with_retry<T, F, Fut>(
    policy: &BackoffPolicy,
    timeout: Duration,
    operation: &'static str,
    mut call: F,
    mut on_retry: impl FnMut(u32, &AdapterError),
) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut retries = 0;
    loop {
        let outcome = match tokio::time::timeout(timeout, call()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AdapterError::timed_out(operation, timeout)),
        };
        match outcome {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    retries,
                };
            }
            Err(err) if err.is_retryable() && retries < policy.max_retries() => {
                on_retry(retries + 1, &err);
                tokio::time::sleep(policy.delay(retries)).await;
                retries += 1;
            }
            Err(err) => {
                return Attempted {
                    result: Err(err),
                    retries,
                };
            }
        }
    }
}
