//! In-flight call bounding via a counting semaphore.

use crate::message::{CallContext, Request};
use crate::pipeline::{priority, Next, PipelineBehavior};
use async_trait::async_trait;
use relay_common::DispatchError;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct ConcurrencyLimitBehavior<R> {
    semaphore: Arc<Semaphore>,
    /// Callers allowed to wait for a permit; zero denies immediately on
    /// saturation.
    queue_depth: u32,
    waiters: AtomicU32,
    _marker: PhantomData<fn(R)>,
}

impl<R: Request> ConcurrencyLimitBehavior<R> {
    pub fn new(max_concurrent: u32, queue_depth: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1) as usize)),
            queue_depth,
            waiters: AtomicU32::new(0),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<R: Request> PipelineBehavior<R> for ConcurrencyLimitBehavior<R> {
    fn priority(&self) -> i32 {
        priority::CONCURRENCY_LIMIT
    }

    async fn handle(
        &self,
        request: &R,
        next: Next<'_, R>,
        ctx: &CallContext,
    ) -> Result<R::Response, DispatchError> {
        let _permit = match self.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) if self.queue_depth > 0 => {
                // The waiter count is advisory; slight over-admission under
                // contention is acceptable, unbounded queueing is not.
                if self.waiters.load(Ordering::SeqCst) >= self.queue_depth {
                    return Err(DispatchError::Overloaded);
                }
                self.waiters.fetch_add(1, Ordering::SeqCst);
                let acquired = tokio::select! {
                    _ = ctx.token().cancelled() => Err(DispatchError::Cancelled),
                    permit = self.semaphore.acquire() => {
                        permit.map_err(|_| DispatchError::Overloaded)
                    }
                };
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                acquired?
            }
            Err(_) => return Err(DispatchError::Overloaded),
        };

        next.run(request, ctx).await
    }
}
