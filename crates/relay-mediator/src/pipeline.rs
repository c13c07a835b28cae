//! Behavior chain composition.
//!
//! The chain for a request type is assembled once at build time, sorted by
//! priority descending so higher-priority behaviors wrap lower ones.
//! `Next` is a borrowed, `Copy` view over the memoized slice: invoking it
//! allocates one boxed future per stage and nothing else, and a behavior
//! may run it more than once (retry re-enters the inner segment).

use crate::message::{CallContext, Request, RequestHandler};
use async_trait::async_trait;
use futures::future::BoxFuture;
use relay_common::DispatchError;
use std::sync::Arc;

/// Default priorities of the built-in behaviors. Higher wraps lower; the
/// terminal handler sits inside everything.
pub mod priority {
    pub const TRACING: i32 = 1_000;
    pub const RATE_LIMIT: i32 = 900;
    pub const CIRCUIT_BREAKER: i32 = 800;
    pub const VALIDATION: i32 = 700;
    pub const IDEMPOTENCY: i32 = 600;
    pub const RETRY: i32 = 500;
    pub const CONCURRENCY_LIMIT: i32 = 950;
}

/// Cross-cutting wrapper around the handler.
///
/// A behavior may inspect the request, short-circuit by returning without
/// invoking `next`, invoke `next` multiple times, or rewrite the result.
#[async_trait]
pub trait PipelineBehavior<R: Request>: Send + Sync {
    fn priority(&self) -> i32 {
        0
    }

    async fn handle(
        &self,
        request: &R,
        next: Next<'_, R>,
        ctx: &CallContext,
    ) -> Result<R::Response, DispatchError>;
}

/// Suspended continuation for the rest of the chain.
pub struct Next<'a, R: Request> {
    pub(crate) chain: &'a [Arc<dyn PipelineBehavior<R>>],
    pub(crate) handler: &'a dyn RequestHandler<R>,
}

impl<'a, R: Request> Clone for Next<'a, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, R: Request> Copy for Next<'a, R> {}

impl<'a, R: Request> Next<'a, R> {
    pub(crate) fn new(
        chain: &'a [Arc<dyn PipelineBehavior<R>>],
        handler: &'a dyn RequestHandler<R>,
    ) -> Self {
        Self { chain, handler }
    }

    /// Run the remaining behaviors and the terminal handler.
    pub fn run(
        self,
        request: &'a R,
        ctx: &'a CallContext,
    ) -> BoxFuture<'a, Result<R::Response, DispatchError>> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    chain: rest,
                    handler: self.handler,
                };
                Box::pin(async move { head.handle(request, next, ctx).await })
            }
            None => self.handler.handle(request, ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Ping;

    impl Request for Ping {
        type Response = &'static str;
    }

    struct PingHandler;

    #[async_trait]
    impl RequestHandler<Ping> for PingHandler {
        async fn handle(
            &self,
            _request: &Ping,
            _ctx: &CallContext,
        ) -> Result<&'static str, DispatchError> {
            Ok("pong")
        }
    }

    struct Counting {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl PipelineBehavior<Ping> for Counting {
        async fn handle(
            &self,
            request: &Ping,
            next: Next<'_, Ping>,
            ctx: &CallContext,
        ) -> Result<&'static str, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            next.run(request, ctx).await
        }
    }

    #[tokio::test]
    async fn chain_runs_in_order_and_reaches_handler() {
        let calls = Arc::new(AtomicU32::new(0));
        let chain: Vec<Arc<dyn PipelineBehavior<Ping>>> = vec![
            Arc::new(Counting {
                calls: calls.clone(),
            }),
            Arc::new(Counting {
                calls: calls.clone(),
            }),
        ];
        let handler = PingHandler;
        let ctx = CallContext::new();

        let next = Next::new(&chain, &handler);
        let result = next.run(&Ping, &ctx).await;

        assert_eq!(result.unwrap(), "pong");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn next_is_re_invocable() {
        struct Twice;

        #[async_trait]
        impl PipelineBehavior<Ping> for Twice {
            async fn handle(
                &self,
                request: &Ping,
                next: Next<'_, Ping>,
                ctx: &CallContext,
            ) -> Result<&'static str, DispatchError> {
                let _ = next.run(request, ctx).await;
                next.run(request, ctx).await
            }
        }

        let chain: Vec<Arc<dyn PipelineBehavior<Ping>>> = vec![Arc::new(Twice)];
        let handler = PingHandler;
        let ctx = CallContext::new();

        let result = Next::new(&chain, &handler).run(&Ping, &ctx).await;
        assert_eq!(result.unwrap(), "pong");
    }
}
