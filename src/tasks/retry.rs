//! Per-task retry with exponential backoff

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::TaskError;
use crate::models::RetryConfig;

/// Result of a retried operation
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, TaskError>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted. Each attempt is bounded by `timeout`.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryConfig,
    timeout: Option<Duration>,
    mut op: F,
) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TaskError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(TaskError::Timeout(limit)),
            },
            None => op(attempt).await,
        };

        match result {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = calculate_backoff(attempt, policy);
                warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Task attempt failed, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => {
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                }
            }
        }
    }
}

/// Calculate exponential backoff with jitter
pub fn calculate_backoff(attempt: u32, policy: &RetryConfig) -> Duration {
    if policy.initial_delay_ms == 0 {
        return Duration::ZERO;
    }

    let exponent = attempt.saturating_sub(1).min(30) as i32;
    let base_delay = policy.initial_delay_ms as f64 * policy.backoff_multiplier.powi(exponent);
    let capped = base_delay.min(policy.max_delay_ms as f64);

    // Add jitter (±25%)
    let jitter = capped * 0.25 * (rand_simple() * 2.0 - 1.0);
    let delay = ((capped + jitter) as u64)
        .max(policy.initial_delay_ms)
        .min(policy.max_delay_ms.max(policy.initial_delay_ms));
    Duration::from_millis(delay)
}

/// Simple pseudo-random for jitter
fn rand_simple() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    (nanos as f64) / 1_000_000_000.0
}
