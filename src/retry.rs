//! Bounded exponential backoff.
//!
//! HTTP 429 / 503 errors from model APIs and vector stores are transient and
//! frequent under concurrent load. Every remote call in the pipeline goes
//! through [`retry_transient`], which waits `base_backoff_ms * 2^(attempt-1)`
//! (capped at `max_backoff_ms`) between attempts. A server-specified
//! `Retry-After` wins when it is longer than the computed delay.
//!
//! Non-transient errors are returned on the first attempt.

use crate::backend::BackendError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::warn;

/// Retry settings shared by enrichment, embedding and indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Default: 3.
    pub max_retries: u32,
    /// Delay before the first retry, doubled each time. Default: 500.
    pub base_backoff_ms: u64,
    /// Upper bound for a single delay. Default: 30 000.
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
    /// No retries and no waiting.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Total attempts including the first one.
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Outcome of a retried call: the final result and how many attempts ran.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T, BackendError>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
///
/// `label` identifies the work item in log lines.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) if err.is_transient() && attempt <= policy.max_retries => {
                let mut delay = policy.backoff(attempt);
                if let Some(server) = err.retry_after() {
                    delay = delay.max(server.min(Duration::from_millis(policy.max_backoff_ms)));
                }
                warn!(
                    "{}: attempt {}/{} failed, retrying in {}ms: {}",
                    label,
                    attempt,
                    policy.attempts(),
                    delay.as_millis(),
                    err
                );
                sleep(delay).await;
            }
            Err(err) => {
                return Retried {
                    result: Err(err),
                    attempts: attempt,
                }
            }
        }
    }
}
