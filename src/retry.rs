//! Retry policy with exponential backoff.
//!
//! One policy object serves both levels of retry in the system: a single
//! external call (extraction, parsing, embedding) and a whole task at the
//! queue level. Business logic never sleeps or loops on its own; it hands an
//! async operation and a retryable-error predicate to [`RetryPolicy::run_with`].
//!
//! With the default 500 ms base and 3 retries the wait sequence is
//! 500 ms → 1 s → 2 s.

use crate::error::ExternalError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` means a single attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_backoff_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(retry - 1);
        let ms = self
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms.max(self.base_backoff_ms));
        Duration::from_millis(ms)
    }

    /// Whether another retry is allowed after `retries_done` retries.
    pub fn allows_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// budget is spent.
    ///
    /// `op` receives the 0-based attempt number. Returns the final result and
    /// the number of retries that were performed.
    pub async fn run_with<T, E, F, Fut, P>(&self, label: &str, mut op: F, is_retryable: P) -> (Result<T, E>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(v) => return (Ok(v), attempt),
                Err(e) if is_retryable(&e) && self.allows_retry(attempt) => {
                    let delay = self.backoff(attempt + 1);
                    warn!(
                        "{}: attempt {} failed ({}); retry {}/{} after {}ms",
                        label,
                        attempt + 1,
                        e,
                        attempt + 1,
                        self.max_retries,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }

    /// [`run_with`](Self::run_with) specialised to external capability calls:
    /// only transient failures (including timeouts) are retried.
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> (Result<T, ExternalError>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ExternalError>>,
    {
        self.run_with(label, op, ExternalError::is_transient).await
    }
}
