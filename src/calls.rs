//! Guard applied to every external capability call.
//!
//! Extraction, field parsing and embedding all go through
//! [`ExternalCalls::run`], which stacks three concerns in a fixed order:
//!
//! ```text
//! retry (backoff between attempts)
//!   └─ semaphore permit (global cap on outstanding calls)
//!        └─ timeout (per attempt)
//!             └─ the call itself
//! ```
//!
//! The permit is taken per attempt and released before the backoff sleep,
//! so a page waiting to retry never holds a slot another page could use.

use crate::config::PipelineConfig;
use crate::error::ExternalError;
use crate::retry::RetryPolicy;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Shared limiter, timeout and retry policy for external calls.
#[derive(Debug, Clone)]
pub struct ExternalCalls {
    permits: Arc<Semaphore>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ExternalCalls {
    pub fn new(max_outstanding: usize, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_outstanding.max(1))),
            timeout,
            retry,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.max_external_calls, config.api_timeout(), config.call_retry)
    }

    /// Calls currently allowed to start without waiting.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `op` under the limiter, the per-attempt timeout and the retry
    /// policy. Returns the final result and the number of retries spent.
    ///
    /// A timed-out attempt fails with [`ExternalError::TimedOut`], which is
    /// retried like any other transient failure.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> (Result<T, ExternalError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExternalError>>,
    {
        let timeout = self.timeout;
        let permits = Arc::clone(&self.permits);
        self.retry
            .run(label, |_attempt| {
                let permits = Arc::clone(&permits);
                let fut = op();
                async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|_| ExternalError::Permanent("call limiter closed".into()))?;
                    match tokio::time::timeout(timeout, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(ExternalError::TimedOut(timeout.as_secs())),
                    }
                }
            })
            .await
    }
}
