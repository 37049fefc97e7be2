//! Retry mechanism with exponential backoff
//!
//! Transient remote failures are retried silently (logged, never
//! notified); everything else propagates to the caller on the first
//! attempt.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{Result, SeekerError};

/// Tracks the attempt count and the next backoff delay for one operation.
///
/// Delays are kept in whole milliseconds so the configured cap is exact.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    attempt: usize,
    next_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            next_delay_ms: config.initial_delay_ms,
            config,
            attempt: 0,
        }
    }

    /// Whether the retry budget allows another attempt.
    pub fn should_retry(&self) -> bool {
        self.attempt < self.config.max_retries
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Consume one step of the backoff schedule and return its delay,
    /// jittered upward by up to 30% when enabled.
    pub fn next_delay(&mut self) -> Duration {
        let mut delay_ms = self.next_delay_ms;

        if self.config.jitter {
            use rand::Rng;
            let fraction = rand::thread_rng().gen_range(0.0..0.3);
            delay_ms += (delay_ms as f64 * fraction) as u64;
        }

        self.attempt += 1;
        let grown = (self.next_delay_ms as f64 * self.config.backoff_multiplier as f64) as u64;
        self.next_delay_ms = grown.min(self.config.max_delay_ms);

        Duration::from_millis(delay_ms)
    }

    /// Start the schedule over for a fresh operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_delay_ms = self.config.initial_delay_ms;
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Determine if an error is worth retrying.
///
/// Only genuinely transient failures qualify. A `Conflict` means the slot
/// is gone, a `Parse` error means the page shape changed, and a
/// `DeadlinePassed` will not heal with time.
pub fn is_retryable(error: &SeekerError) -> bool {
    matches!(
        error,
        SeekerError::Remote { .. } | SeekerError::Io(_) | SeekerError::Notification { .. }
    )
}

/// Run `operation` until it succeeds, its failure is non-retryable, or
/// the policy's budget runs out; the last error is returned as-is.
pub async fn retry_async<F, Fut, T>(mut operation: F, policy: &mut RetryPolicy) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match operation().await {
            Ok(result) => {
                if policy.attempt() > 0 {
                    debug!("recovered after {} attempts", policy.attempt() + 1);
                }
                return Ok(result);
            }
            Err(error) => {
                if !is_retryable(&error) {
                    debug!("not retrying: {}", error);
                    return Err(error);
                }

                if !policy.should_retry() {
                    warn!(
                        "giving up after {} retries, last error: {}",
                        policy.config.max_retries, error
                    );
                    return Err(error);
                }

                let delay = policy.next_delay();
                warn!(
                    "attempt {} failed ({}), next try in {:?}",
                    policy.attempt(),
                    error,
                    delay
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy_without_jitter(max_retries: usize) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_delay_ms: 10,
            max_delay_ms: 40,
            backoff_multiplier: 2.0,
            jitter: false,
        })
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut policy = policy_without_jitter(10);
        assert_eq!(policy.next_delay(), Duration::from_millis(10));
        assert_eq!(policy.next_delay(), Duration::from_millis(20));
        assert_eq!(policy.next_delay(), Duration::from_millis(40));
        // capped
        assert_eq!(policy.next_delay(), Duration::from_millis(40));
    }

    #[test]
    fn classifier_marks_expected_failures_permanent() {
        assert!(is_retryable(&SeekerError::remote("503")));
        assert!(!is_retryable(&SeekerError::Conflict));
        assert!(!is_retryable(&SeekerError::parse("shape changed")));
        assert!(!is_retryable(&SeekerError::DeadlinePassed));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let mut policy = policy_without_jitter(3);
        let result = retry_async(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(SeekerError::remote("flaky"))
                    } else {
                        Ok(n)
                    }
                }
            },
            &mut policy,
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn conflict_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let mut policy = policy_without_jitter(3);
        let result: Result<()> = retry_async(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SeekerError::Conflict) }
            },
            &mut policy,
        )
        .await;
        assert!(matches!(result, Err(SeekerError::Conflict)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicUsize::new(0);
        let mut policy = policy_without_jitter(2);
        let result: Result<()> = retry_async(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SeekerError::remote("down")) }
            },
            &mut policy,
        )
        .await;
        assert!(matches!(result, Err(SeekerError::Remote { .. })));
        // initial attempt + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
