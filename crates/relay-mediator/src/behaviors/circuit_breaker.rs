//! Per-request-type circuit breaker.

use crate::breaker::CircuitBreaker;
use crate::message::{CallContext, Request};
use crate::pipeline::{priority, Next, PipelineBehavior};
use async_trait::async_trait;
use relay_common::{DispatchError, ErrorKind};
use std::marker::PhantomData;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

pub struct CircuitBreakerBehavior<R> {
    breaker: CircuitBreaker,
    _marker: PhantomData<fn(R)>,
}

impl<R: Request> CircuitBreakerBehavior<R> {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            breaker: CircuitBreaker::new(
                R::name(),
                settings.failure_threshold,
                settings.reset_timeout,
            ),
            _marker: PhantomData,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl<R: Request> PipelineBehavior<R> for CircuitBreakerBehavior<R> {
    fn priority(&self) -> i32 {
        priority::CIRCUIT_BREAKER
    }

    async fn handle(
        &self,
        request: &R,
        next: Next<'_, R>,
        ctx: &CallContext,
    ) -> Result<R::Response, DispatchError> {
        if !self.breaker.try_acquire() {
            return Err(DispatchError::CircuitOpen(R::name().to_string()));
        }

        let result = next.run(request, ctx).await;

        // Only transient failures and timeouts count against the breaker.
        // Everything else proves the downstream is answering, which also
        // releases a half-open probe.
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) if matches!(e.kind(), ErrorKind::Transient | ErrorKind::Timeout) => {
                self.breaker.record_failure()
            }
            Err(_) => self.breaker.record_success(),
        }

        result
    }
}
