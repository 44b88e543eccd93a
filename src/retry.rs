//! Bounded exponential backoff for operations against a dependency that
//! may be briefly unavailable, such as the broker at boot.

use crate::error::Result;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// How often and how patiently to retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. At least 1.
    pub max_attempts: u32,
    /// Wait after the first failure.
    pub initial_backoff: Duration,
    /// Cap on any single wait.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt, fail immediately.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Wait before attempt `attempt + 1`, given `attempt` failures so far
    /// (1-based). Doubles each time, capped at `max_backoff`.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// Run `op` until it succeeds or the policy is exhausted. Returns the last
/// error on exhaustion.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                metrics::retry_attempts().add(
                    1,
                    &[
                        KeyValue::new("operation", operation.to_string()),
                        KeyValue::new("result", "ok"),
                    ],
                );
                if attempt > 1 {
                    info!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                metrics::retry_attempts().add(
                    1,
                    &[
                        KeyValue::new("operation", operation.to_string()),
                        KeyValue::new("result", "error"),
                    ],
                );
                if attempt >= max_attempts {
                    return Err(e);
                }
                let backoff = policy.backoff_after(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
