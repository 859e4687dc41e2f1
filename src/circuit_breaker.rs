//! # Circuit Breaker Module
//!
//! Protects the field recognizer endpoint: after repeated terminal failures the
//! pipeline stops calling it for a while and fails fast with
//! `RecognitionUnavailable`, giving the backend time to recover.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::config::RecoveryConfig;

/// Circuit breaker for recognizer calls
///
/// ```text
/// CLOSED ────failures ≥ threshold────► OPEN
///    ▲                                   │
///    └──────────reset timeout────────────┘
/// ```
///
/// - **CLOSED → OPEN**: when the failure count reaches `circuit_breaker_threshold`
/// - **OPEN → CLOSED**: after `circuit_breaker_reset_secs`; the next call probes the backend
/// - any success resets the failure count
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    threshold: u32,
    reset_after: Duration,
}

#[derive(Debug, Default)]
struct BreakerState {
    failure_count: u32,
    last_failure_time: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            state: Mutex::new(BreakerState::default()),
            threshold: config.circuit_breaker_threshold,
            reset_after: Duration::from_secs(config.circuit_breaker_reset_secs),
        }
    }

    /// Check if the circuit is open (blocking requests).
    ///
    /// Resets automatically once the reset timeout elapsed since the last failure.
    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock();

        if state.failure_count >= self.threshold {
            if let Some(last_time) = state.last_failure_time {
                if last_time.elapsed() < self.reset_after {
                    return true;
                }
                *state = BreakerState::default();
            }
        }
        false
    }

    /// Record a terminal failure
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());
    }

    /// Record a success to reset the failure counter
    pub fn record_success(&self) {
        *self.state.lock() = BreakerState::default();
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, reset_secs: u64) -> RecoveryConfig {
        RecoveryConfig {
            circuit_breaker_threshold: threshold,
            circuit_breaker_reset_secs: reset_secs,
            ..Default::default()
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(&config(2, 60));
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn test_success_resets() {
        let breaker = CircuitBreaker::new(&config(2, 60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(!breaker.is_open());
        assert_eq!(breaker.failure_count(), 1);
    }

    #[test]
    fn test_resets_after_timeout() {
        let breaker = CircuitBreaker {
            state: Mutex::new(BreakerState::default()),
            threshold: 1,
            reset_after: Duration::from_millis(10),
        };
        breaker.record_failure();
        assert!(breaker.is_open());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!breaker.is_open());
        assert_eq!(breaker.failure_count(), 0);
    }
}
