//! Token-bucket rate limiting per request type.

use crate::message::{CallContext, Request};
use crate::pipeline::{priority, Next, PipelineBehavior};
use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use metrics::counter;
use nonzero_ext::nonzero;
use relay_common::DispatchError;
use std::marker::PhantomData;
use std::num::NonZeroU32;

pub struct RateLimitBehavior<R> {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    _marker: PhantomData<fn(R)>,
}

impl<R: Request> RateLimitBehavior<R> {
    /// Sustained `rate_per_second` with `burst` extra immediate capacity.
    /// Refill is monotonic-clock based.
    pub fn new(rate_per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(rate_per_second).unwrap_or(nonzero!(1u32));
        let burst = NonZeroU32::new(burst).unwrap_or(nonzero!(1u32));
        Self {
            limiter: RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<R: Request> PipelineBehavior<R> for RateLimitBehavior<R> {
    fn priority(&self) -> i32 {
        priority::RATE_LIMIT
    }

    async fn handle(
        &self,
        request: &R,
        next: Next<'_, R>,
        ctx: &CallContext,
    ) -> Result<R::Response, DispatchError> {
        if self.limiter.check().is_err() {
            counter!("relay_rate_limited_total", "type" => R::name()).increment(1);
            return Err(DispatchError::RateLimited);
        }

        next.run(request, ctx).await
    }
}
