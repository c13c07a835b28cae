//! Structured span around each invocation.

use crate::message::{CallContext, Request};
use crate::pipeline::{priority, Next, PipelineBehavior};
use async_trait::async_trait;
use relay_common::DispatchError;
use std::marker::PhantomData;
use std::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub struct TracingBehavior<R> {
    _marker: PhantomData<fn(R)>,
}

impl<R> Default for TracingBehavior<R> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<R: Request> PipelineBehavior<R> for TracingBehavior<R> {
    fn priority(&self) -> i32 {
        priority::TRACING
    }

    async fn handle(
        &self,
        request: &R,
        next: Next<'_, R>,
        ctx: &CallContext,
    ) -> Result<R::Response, DispatchError> {
        let span = info_span!(
            "dispatch",
            request_type = R::name(),
            correlation_id = ctx.correlation_id().unwrap_or(""),
        );
        let start = Instant::now();

        let result = next.run(request, ctx).instrument(span).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(
                request_type = R::name(),
                duration_ms, "request completed"
            ),
            Err(e) => warn!(
                request_type = R::name(),
                duration_ms,
                kind = e.kind().as_str(),
                error = %e,
                "request failed"
            ),
        }
        result
    }
}
