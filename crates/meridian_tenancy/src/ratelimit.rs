//! Token-bucket rate limiting with per-upstream bulkheads.
//!
//! Each (tenant, bucket key) pair gets an independent bucket; buckets for
//! different upstream integrations are isolated so one hot integration
//! cannot starve the rest. Tokens refill continuously based on elapsed time.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use meridian_protocol::ToolError;
use tracing::debug;

/// Capacity and refill for one bucket.
#[derive(Debug, Clone, Copy)]
pub struct BucketLimits {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Refill tokens based on elapsed time and try to consume one.
/// Returns `Ok(())` on success, or the wait until a token frees up.
fn refill_and_try_consume(
    bucket: &mut TokenBucket,
    limits: BucketLimits,
) -> Result<(), Duration> {
    let now = Instant::now();
    let elapsed = now.duration_since(bucket.last_refill);
    bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * limits.refill_per_sec)
        .min(limits.capacity);
    bucket.last_refill = now;

    if bucket.tokens >= 1.0 {
        bucket.tokens -= 1.0;
        Ok(())
    } else {
        let deficit = 1.0 - bucket.tokens;
        Err(Duration::from_secs_f64(deficit / limits.refill_per_sec))
    }
}

/// Limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub enabled: bool,
    /// How long an acquire may wait for a token before giving up.
    pub max_wait: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_wait: Duration::from_secs(2),
        }
    }
}

/// A token-bucket rate limiter keyed by string. Keys combine tenant and
/// bucket (e.g. `"acme/tools"`, `"acme/upstream:shopify"`).
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Try once; on failure return the wait until a token frees up.
    pub fn try_acquire(&self, key: &str, limits: BucketLimits) -> Result<(), Duration> {
        if !self.config.enabled {
            return Ok(());
        }
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: limits.capacity,
                last_refill: Instant::now(),
            });
        refill_and_try_consume(entry.value_mut(), limits)
    }

    /// Acquire a token, waiting up to the configured max wait. Past that the
    /// caller gets `RESOURCE_EXHAUSTED` with a `retryAfter` hint.
    pub async fn acquire(&self, key: &str, limits: BucketLimits) -> Result<(), ToolError> {
        if !self.config.enabled {
            return Ok(());
        }

        let deadline = Instant::now() + self.config.max_wait;
        loop {
            match self.try_acquire(key, limits) {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    let now = Instant::now();
                    if now + wait > deadline {
                        let retry_after = wait.as_secs().max(1);
                        debug!("rate limit exceeded for {}", key);
                        return Err(ToolError::resource_exhausted(format!(
                            "rate limit exceeded for {key}"
                        ))
                        .with_retry_after(retry_after));
                    }
                    tokio::time::sleep(wait.min(Duration::from_millis(50))).await;
                }
            }
        }
    }

    /// Bulkhead key for an upstream integration.
    pub fn upstream_key(tenant: &str, upstream: &str) -> String {
        format!("{tenant}/upstream:{upstream}")
    }

    /// Bucket key for general tool entry.
    pub fn tools_key(tenant: &str, tool: &str) -> String {
        format!("{tenant}/tool:{tool}")
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_protocol::ErrorCode;

    fn limits(capacity: f64, refill: f64) -> BucketLimits {
        BucketLimits {
            capacity,
            refill_per_sec: refill,
        }
    }

    #[test]
    fn test_burst_up_to_capacity() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        let l = limits(3.0, 1.0);

        assert!(limiter.try_acquire("t/a", l).is_ok());
        assert!(limiter.try_acquire("t/a", l).is_ok());
        assert!(limiter.try_acquire("t/a", l).is_ok());
        assert!(limiter.try_acquire("t/a", l).is_err());
    }

    #[test]
    fn test_buckets_are_independent() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        let l = limits(1.0, 1.0);

        assert!(limiter.try_acquire("acme/upstream:shopify", l).is_ok());
        assert!(limiter.try_acquire("acme/upstream:shopify", l).is_err());
        // A different upstream bulkhead is unaffected.
        assert!(limiter.try_acquire("acme/upstream:fedex", l).is_ok());
        // As is another tenant.
        assert!(limiter.try_acquire("globex/upstream:shopify", l).is_ok());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            enabled: true,
            max_wait: Duration::from_millis(500),
        });
        let l = limits(1.0, 20.0); // refills in 50ms

        limiter.acquire("t/b", l).await.unwrap();
        // Second acquire waits ~50ms and succeeds within max_wait.
        limiter.acquire("t/b", l).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_exhausted_with_retry_after() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            enabled: true,
            max_wait: Duration::from_millis(10),
        });
        let l = limits(1.0, 0.1); // refills every 10s

        limiter.acquire("t/c", l).await.unwrap();
        let err = limiter.acquire("t/c", l).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ResourceExhausted);
        assert!(err.retry_after.unwrap_or(0) >= 1);
    }

    #[test]
    fn test_disabled_limiter_admits_everything() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            enabled: false,
            max_wait: Duration::ZERO,
        });
        let l = limits(1.0, 0.001);
        for _ in 0..100 {
            assert!(limiter.try_acquire("t/d", l).is_ok());
        }
    }
}
