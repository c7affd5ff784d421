//! Central retry combinator with exponential backoff.
//!
//! Retries are policy values, not scattered helpers: callers describe the
//! attempt budget and delay curve once and pass a predicate deciding which
//! errors are transient.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Backoff policy for a retried operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Add up to 20% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Delay before attempt `n` (attempts are 1-based; attempt 1 has none).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(30);
        let raw = self.base_delay.as_secs_f64() * self.factor.powi(exp as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let with_jitter = if self.jitter {
            let mut rng = rand::thread_rng();
            capped * (1.0 + rng.gen_range(0.0..0.2))
        } else {
            capped
        };
        Duration::from_secs_f64(with_jitter.min(self.max_delay.as_secs_f64()))
    }
}

/// Run `op` until it succeeds, the error is not transient per `is_transient`,
/// or the attempt budget is exhausted. Returns the last error on give-up.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    what: &str,
    is_transient: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_attempts || !is_transient(&err) {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt + 1);
                debug!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what, attempt, policy.max_attempts, err, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            retry_with_backoff(&fast_policy(), "probe", |_| true, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            &fast_policy(),
            "probe",
            |e: &String| e == "transient",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("syntax error".to_string())
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            retry_with_backoff(&fast_policy(), "probe", |_| true, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("transient".to_string())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_delay_curve_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            factor: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(1));
    }
}
