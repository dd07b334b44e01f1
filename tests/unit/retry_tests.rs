//! Retry policy tests

use kbflow::tasks::retry::{calculate_backoff, with_retry};
use kbflow::tasks::{TaskError, TaskFailure};
use kbflow::RetryConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[tokio::test]
async fn test_retry_config_defaults() {
    let policy = RetryConfig::default();
    assert_eq!(policy.max_attempts, 3);
    assert_eq!(policy.initial_delay_ms, 1000);
    assert_eq!(policy.max_delay_ms, 60000);
    assert_eq!(policy.backoff_multiplier, 2.0);
}

#[tokio::test]
async fn test_succeeds_first_try() {
    let attempted = with_retry(&RetryConfig::immediate(3), None, |_| async {
        Ok::<_, TaskError>("done")
    })
    .await;

    assert_eq!(attempted.attempts, 1);
    assert_eq!(attempted.result.unwrap(), "done");
}

#[tokio::test]
async fn test_transient_errors_retry_until_success() {
    let calls = AtomicU32::new(0);

    let attempted = with_retry(&RetryConfig::immediate(5), None, |attempt| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt < 3 {
                Err(TaskError::Transient("busy".into()))
            } else {
                Ok(attempt)
            }
        }
    })
    .await;

    assert_eq!(attempted.attempts, 3);
    assert_eq!(attempted.result.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_attempts_are_bounded_by_policy() {
    let attempted = with_retry(&RetryConfig::immediate(4), None, |_| async {
        Err::<(), _>(TaskError::Transient("still busy".into()))
    })
    .await;

    assert_eq!(attempted.attempts, 4);
    assert!(matches!(attempted.result, Err(TaskError::Transient(_))));
}

#[tokio::test]
async fn test_non_retryable_errors_settle_immediately() {
    let attempted = with_retry(&RetryConfig::immediate(5), None, |_| async {
        Err::<(), _>(TaskError::failed("Provisioning.Failed", "ROLLBACK_COMPLETE"))
    })
    .await;

    assert_eq!(attempted.attempts, 1);
    let failure = TaskFailure::from_error(&attempted.result.unwrap_err(), attempted.attempts);
    assert_eq!(failure.error, "Provisioning.Failed");
    assert_eq!(failure.cause, "ROLLBACK_COMPLETE");
}

#[tokio::test]
async fn test_attempt_timeout_is_retried() {
    let attempted = with_retry(
        &RetryConfig::immediate(2),
        Some(Duration::from_millis(20)),
        |attempt| async move {
            if attempt == 1 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok::<_, TaskError>(attempt)
        },
    )
    .await;

    assert_eq!(attempted.attempts, 2);
    assert_eq!(attempted.result.unwrap(), 2);
}

#[tokio::test]
async fn test_zero_max_attempts_still_tries_once() {
    let attempted = with_retry(&RetryConfig::immediate(0), None, |_| async {
        Err::<(), _>(TaskError::Transient("x".into()))
    })
    .await;

    assert_eq!(attempted.attempts, 1);
}

#[test]
fn test_backoff_respects_cap() {
    let policy = RetryConfig {
        max_attempts: 20,
        initial_delay_ms: 500,
        max_delay_ms: 2000,
        backoff_multiplier: 3.0,
    };

    for attempt in 1..20 {
        let delay = calculate_backoff(attempt, &policy);
        assert!(delay >= Duration::from_millis(500), "attempt {}", attempt);
        assert!(delay <= Duration::from_millis(2000), "attempt {}", attempt);
    }
}
