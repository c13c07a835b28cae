//! Circuit breaker.
//!
//! Counts consecutive transient failures; at the threshold the breaker
//! opens and short-circuits callers until the cool-down elapses, then
//! admits exactly one half-open probe. Probe success closes the breaker,
//! probe failure re-opens it. Timing is monotonic (`Instant`), never
//! wall-clock.

use metrics::counter;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    name: String,
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    probe_in_flight: AtomicBool,

    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            probe_in_flight: AtomicBool::new(false),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
        }
    }

    /// Whether a call may proceed. In half-open only a single probe gets
    /// through; everyone else keeps seeing the open circuit.
    pub fn try_acquire(&self) -> bool {
        let state = *self.state.read();

        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = self
                    .opened_at
                    .read()
                    .map(|t| t.elapsed() >= self.reset_timeout)
                    .unwrap_or(false);
                if !cooled_down {
                    return false;
                }
                {
                    let mut state = self.state.write();
                    if *state == CircuitState::Open {
                        *state = CircuitState::HalfOpen;
                        self.probe_in_flight.store(false, Ordering::SeqCst);
                        debug!(breaker = %self.name, "circuit breaker half-open");
                    }
                }
                !self.probe_in_flight.swap(true, Ordering::SeqCst)
            }
            CircuitState::HalfOpen => !self.probe_in_flight.swap(true, Ordering::SeqCst),
        }
    }

    pub fn record_success(&self) {
        let state = *self.state.read();

        match state {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                *self.state.write() = CircuitState::Closed;
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.probe_in_flight.store(false, Ordering::SeqCst);
                debug!(breaker = %self.name, "circuit breaker closed after probe success");
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let state = *self.state.read();

        match state {
            CircuitState::Closed => {
                let count = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.failure_threshold {
                    self.open();
                    warn!(
                        breaker = %self.name,
                        failures = count,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.open();
                warn!(breaker = %self.name, "circuit breaker re-opened on probe failure");
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self) {
        *self.state.write() = CircuitState::Open;
        *self.opened_at.write() = Some(Instant::now());
        self.probe_in_flight.store(false, Ordering::SeqCst);
        counter!("relay_circuit_opened_total", "breaker" => self.name.clone()).increment(1);
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_at_threshold() {
        let breaker = CircuitBreaker::new("t", 3, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new("t", 3, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let breaker = CircuitBreaker::new("t", 1, Duration::from_millis(0));

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Zero cool-down: the next acquire moves to half-open.
        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.try_acquire());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire());
    }

    #[test]
    fn probe_failure_reopens() {
        let breaker = CircuitBreaker::new("t", 1, Duration::from_millis(0));

        breaker.record_failure();
        assert!(breaker.try_acquire());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
