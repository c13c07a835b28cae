//! Admission gate applied ahead of pipeline dispatch for `send`.
//!
//! Order is fixed: rate limit, then circuit breaker, then concurrency cap.
//! The returned permit releases the concurrency slot on drop and feeds the
//! call outcome back into the breaker.

use crate::breaker::CircuitBreaker;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use metrics::counter;
use nonzero_ext::nonzero;
use relay_common::{DispatchError, ErrorKind};
use relay_config::AdmissionConfig;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct AdmissionGate {
    rate_limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    breaker: Option<Arc<CircuitBreaker>>,
    semaphore: Option<Arc<Semaphore>>,
    queue_depth: u32,
    waiters: AtomicU32,
}

impl AdmissionGate {
    /// `None` when every admission control is disabled.
    pub fn from_config(config: &AdmissionConfig) -> Option<Self> {
        if !config.enable_rate_limit
            && !config.enable_circuit_breaker
            && !config.enable_concurrency_limit
        {
            return None;
        }

        let rate_limiter = config.enable_rate_limit.then(|| {
            let rate = NonZeroU32::new(config.rate_per_second).unwrap_or(nonzero!(1u32));
            let burst = NonZeroU32::new(config.burst).unwrap_or(nonzero!(1u32));
            RateLimiter::direct(Quota::per_second(rate).allow_burst(burst))
        });

        let breaker = config.enable_circuit_breaker.then(|| {
            Arc::new(CircuitBreaker::new(
                "admission",
                config.failure_threshold,
                config.reset_timeout(),
            ))
        });

        let semaphore = config
            .enable_concurrency_limit
            .then(|| Arc::new(Semaphore::new(config.max_concurrent.max(1) as usize)));

        Some(Self {
            rate_limiter,
            breaker,
            semaphore,
            queue_depth: config.queue_depth,
            waiters: AtomicU32::new(0),
        })
    }

    pub async fn admit(&self) -> Result<AdmissionPermit, DispatchError> {
        if let Some(limiter) = &self.rate_limiter {
            if limiter.check().is_err() {
                counter!("relay_rate_limited_total", "type" => "admission").increment(1);
                return Err(DispatchError::RateLimited);
            }
        }

        if let Some(breaker) = &self.breaker {
            if !breaker.try_acquire() {
                return Err(DispatchError::CircuitOpen("admission".to_string()));
            }
        }

        let permit = match &self.semaphore {
            Some(semaphore) => Some(self.acquire_slot(semaphore).await?),
            None => None,
        };

        Ok(AdmissionPermit {
            _permit: permit,
            breaker: self.breaker.clone(),
        })
    }

    async fn acquire_slot(
        &self,
        semaphore: &Arc<Semaphore>,
    ) -> Result<OwnedSemaphorePermit, DispatchError> {
        match semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(_) if self.queue_depth > 0 => {
                // Advisory bound on the waiter queue; a small overshoot
                // under contention beats taking a lock here.
                if self.waiters.load(Ordering::SeqCst) >= self.queue_depth {
                    return Err(DispatchError::Overloaded);
                }
                self.waiters.fetch_add(1, Ordering::SeqCst);
                let permit = semaphore.clone().acquire_owned().await;
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                permit.map_err(|_| DispatchError::Overloaded)
            }
            Err(_) => Err(DispatchError::Overloaded),
        }
    }
}

/// Live admission for one call.
pub struct AdmissionPermit {
    _permit: Option<OwnedSemaphorePermit>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl AdmissionPermit {
    /// Feed the call outcome into the breaker. Transient failures and
    /// timeouts count against it; anything else counts as a response.
    pub fn complete(self, error: Option<&DispatchError>) {
        if let Some(breaker) = &self.breaker {
            match error {
                Some(e) if matches!(e.kind(), ErrorKind::Transient | ErrorKind::Timeout) => {
                    breaker.record_failure()
                }
                _ => breaker.record_success(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(config: AdmissionConfig) -> AdmissionGate {
        AdmissionGate::from_config(&config).expect("at least one control enabled")
    }

    #[test]
    fn fully_disabled_config_builds_no_gate() {
        assert!(AdmissionGate::from_config(&AdmissionConfig::default()).is_none());
    }

    #[tokio::test]
    async fn burst_is_honored_then_rate_limited() {
        let gate = gate(AdmissionConfig {
            enable_rate_limit: true,
            rate_per_second: 1,
            burst: 3,
            ..AdmissionConfig::default()
        });

        for _ in 0..3 {
            let permit = gate.admit().await.expect("inside burst");
            permit.complete(None);
        }
        let denied = gate.admit().await;
        assert!(matches!(denied, Err(DispatchError::RateLimited)));
    }

    #[tokio::test]
    async fn saturation_without_queue_denies() {
        let gate = gate(AdmissionConfig {
            enable_concurrency_limit: true,
            max_concurrent: 1,
            queue_depth: 0,
            ..AdmissionConfig::default()
        });

        let held = gate.admit().await.expect("first slot");
        let denied = gate.admit().await;
        assert!(matches!(denied, Err(DispatchError::Overloaded)));
        held.complete(None);
    }

    #[tokio::test]
    async fn breaker_opens_after_transient_failures() {
        let gate = gate(AdmissionConfig {
            enable_circuit_breaker: true,
            failure_threshold: 2,
            reset_timeout_seconds: 60,
            ..AdmissionConfig::default()
        });

        for _ in 0..2 {
            let permit = gate.admit().await.expect("closed breaker admits");
            permit.complete(Some(&DispatchError::Transient("broker down".into())));
        }

        let denied = gate.admit().await;
        assert!(matches!(denied, Err(DispatchError::CircuitOpen(_))));
    }
}
