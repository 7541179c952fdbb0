//! Retry policy with capped exponential backoff.

use std::future::Future;
use std::time::Duration;

/// How an operation is retried.
///
/// `max_attempts == 0` retries forever; the delay between attempts grows by
/// `backoff_coefficient` and never exceeds `max_interval`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_interval: Duration::from_secs(5),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(5 * 60 * 60),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the retry following `attempt` (1-indexed).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = delay.min(self.max_interval.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt >= self.max_attempts
    }

    /// Run `op` until it succeeds or the policy is exhausted, returning the
    /// last error in that case.
    pub async fn retry<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if self.is_exhausted(attempt) => return Err(e),
                Err(e) => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_interval: Duration::from_millis(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 0,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(10),
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(10));
        assert_eq!(policy.backoff_delay(1000), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_max_attempts_is_unbounded() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(1));
        assert!(!policy.is_exhausted(u32::MAX));
    }

    #[test]
    fn test_bounded_policy_exhausts() {
        let policy = fast_policy(3);
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(RetryPolicy::no_retry().is_exhausted(1));
    }

    #[test]
    fn test_default_ceiling_is_hours() {
        assert!(RetryPolicy::default().max_interval >= Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u32, String> = fast_policy(0)
            .retry("flaky", || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 4 { Err(format!("fail {}", n)) } else { Ok(n) }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_returns_last_error_when_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), String> = fast_policy(2)
            .retry("always-fails", || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(format!("fail {}", n))
                }
            })
            .await;
        assert_eq!(result.unwrap_err(), "fail 2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
