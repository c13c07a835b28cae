//! Retry with exponential backoff and jitter.

use crate::message::{CallContext, Request};
use crate::pipeline::{priority, Next, PipelineBehavior};
use async_trait::async_trait;
use metrics::counter;
use rand::Rng;
use relay_common::DispatchError;
use relay_config::RetryConfig;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which failures to retry and how to space the attempts.
///
/// The classifier defaults to `is_transient`, so terminal kinds
/// (validation, serialization, bad request) never loop.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    pub classify: Arc<dyn Fn(&DispatchError) -> bool + Send + Sync>,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: config.base_backoff(),
            backoff_factor: config.backoff_factor,
            max_backoff: config.max_backoff(),
            classify: Arc::new(DispatchError::is_transient),
        }
    }

    pub fn with_classifier(
        mut self,
        classify: impl Fn(&DispatchError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.classify = Arc::new(classify);
        self
    }

    /// Delay before retry number `retry_index` (zero-based):
    /// `base * factor^i + jitter[0, base/2]`, capped at `max_backoff`.
    fn delay(&self, retry_index: u32) -> Duration {
        let scaled = self
            .base_backoff
            .mul_f64(self.backoff_factor.powi(retry_index as i32));
        let jitter_ceiling = (self.base_backoff / 2).max(Duration::from_millis(1));
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..jitter_ceiling);
        (scaled + jitter).min(self.max_backoff)
    }
}

pub struct RetryBehavior<R> {
    policy: RetryPolicy,
    _marker: PhantomData<fn(R)>,
}

impl<R> RetryBehavior<R> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<R: Request> PipelineBehavior<R> for RetryBehavior<R> {
    fn priority(&self) -> i32 {
        priority::RETRY
    }

    async fn handle(
        &self,
        request: &R,
        next: Next<'_, R>,
        ctx: &CallContext,
    ) -> Result<R::Response, DispatchError> {
        let mut retries = 0u32;

        loop {
            let result = next.run(request, ctx).await;

            let error = match result {
                Err(e) if (self.policy.classify)(&e) && retries + 1 < self.policy.max_attempts => {
                    e
                }
                other => return other,
            };

            let delay = self.policy.delay(retries);
            retries += 1;

            // Respect the call deadline: do not sleep past it.
            if let Some(remaining) = ctx.remaining() {
                if remaining <= delay {
                    return Err(error);
                }
            }

            counter!("relay_retried_total", "type" => R::name()).increment(1);
            debug!(
                request_type = R::name(),
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after transient failure"
            );

            tokio::select! {
                _ = ctx.token().cancelled() => return Err(DispatchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
