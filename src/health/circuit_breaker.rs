//! Circuit breaker guarding a logical backend.
//!
//! Opens after a run of consecutive transient failures, rejects calls for
//! a cooldown, then admits a single probe before closing again. State is
//! instance-local; there is no cross-node coordination.

use crate::config::BreakerConfig;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Circuit breaker state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls allowed
    Closed,

    /// Failing, calls rejected until the cooldown elapses
    Open,

    /// Testing recovery with a single probe
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    /// Logical backend identifier, for logs
    name: String,

    failure_threshold: u32,
    cooldown: Duration,

    inner: Mutex<BreakerInner>,
}

/// Snapshot for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold,
            cooldown: Duration::from_millis(config.cooldown_ms),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Whether a call may proceed right now. An `Open` breaker flips to
    /// `HalfOpen` once the cooldown has elapsed and hands out exactly one
    /// probe slot.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(breaker = %self.name, "circuit breaker half-open, probing");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                info!(breaker = %self.name, "circuit breaker closed (recovered)");
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    error!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "circuit breaker open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed, back to open with the cooldown refreshed.
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                error!(breaker = %self.name, "circuit breaker re-opened (probe failed)");
            }
            CircuitState::Open => {}
        }
    }

    pub fn current_state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            &BreakerConfig {
                failure_threshold: threshold,
                cooldown_ms,
            },
        )
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = breaker(3, 50);
        assert_eq!(breaker.current_state(), CircuitState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        // A success resets the run.
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.current_state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.current_state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[tokio::test]
    async fn half_open_admits_single_probe() {
        let breaker = breaker(1, 30);
        breaker.record_failure();
        assert!(!breaker.try_acquire());

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(breaker.try_acquire());
        assert_eq!(breaker.current_state(), CircuitState::HalfOpen);
        // Second caller while the probe is in flight is rejected.
        assert!(!breaker.try_acquire());

        breaker.record_success();
        assert_eq!(breaker.current_state(), CircuitState::Closed);
        assert!(breaker.try_acquire());
    }

    #[tokio::test]
    async fn failed_probe_refreshes_cooldown() {
        let breaker = breaker(1, 30);
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(breaker.try_acquire());
        breaker.record_failure();
        assert_eq!(breaker.current_state(), CircuitState::Open);
        assert!(!breaker.try_acquire());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(breaker.try_acquire());
    }
}
