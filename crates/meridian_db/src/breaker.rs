//! Circuit breaker protecting a single connection pool.
//!
//! CLOSED admits everything. After `failure_threshold` consecutive failures
//! the breaker opens and records a cooldown; while OPEN every call fails
//! fast. Once the cooldown elapses the breaker moves to HALF_OPEN and admits
//! exactly one probe: success closes the circuit and resets the counters,
//! failure re-opens it with a doubled (capped) cooldown.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{DbError, Result};

/// Breaker states, reported in health snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Initial cooldown once open.
    pub cooldown: Duration,
    /// Ceiling for the exponentially extended cooldown.
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    current_cooldown: Duration,
    probe_in_flight: bool,
    last_failure: Option<Instant>,
}

/// Circuit breaker. One per managed pool.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub cooldown_remaining_ms: u64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                current_cooldown: Duration::ZERO,
                probe_in_flight: false,
                last_failure: None,
            }),
        }
    }

    /// Gate a call. Returns `Ok(())` when the call may proceed; while OPEN
    /// (or while a HALF_OPEN probe is already in flight) fails fast.
    pub fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened_at = inner.opened_at.expect("open breaker has no open timestamp");
                if opened_at.elapsed() >= inner.current_cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    let remaining = inner.current_cooldown - opened_at.elapsed();
                    Err(DbError::Unavailable(format!(
                        "circuit open; retry in {}s",
                        remaining.as_secs().max(1)
                    )))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(DbError::Unavailable(
                        "circuit half-open; probe already in flight".to_string(),
                    ))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != BreakerState::Closed {
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            inner.current_cooldown = Duration::ZERO;
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.current_cooldown = self.config.cooldown;
                }
            }
            BreakerState::HalfOpen => {
                // Probe failed: back to open with an extended cooldown.
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                let doubled = inner.current_cooldown.saturating_mul(2);
                inner.current_cooldown = doubled.min(self.config.max_cooldown).max(self.config.cooldown);
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        let cooldown_remaining_ms = match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(at)) => inner
                .current_cooldown
                .saturating_sub(at.elapsed())
                .as_millis() as u64,
            _ => 0,
        };
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            cooldown_remaining_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(20),
            max_cooldown: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(test_config());

        for _ in 0..2 {
            breaker.admit().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.admit().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Fails fast without touching the pool.
        assert!(matches!(breaker.admit(), Err(DbError::Unavailable(_))));
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(25));

        // Exactly one probe admitted.
        breaker.admit().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.admit().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.admit().unwrap();
    }

    #[test]
    fn test_failed_probe_extends_cooldown() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        breaker.admit().unwrap();
        breaker.record_failure();

        assert_eq!(breaker.state(), BreakerState::Open);
        let snapshot = breaker.snapshot();
        // Doubled from 20ms.
        assert!(snapshot.cooldown_remaining_ms > 20);
    }

    #[test]
    fn test_success_resets_counter() {
        let breaker = CircuitBreaker::new(test_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
