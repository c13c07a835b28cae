//! Duplicate suppression keyed by message id.
//!
//! Consults the idempotency store before invoking downstream. On a hit the
//! recorded response is decoded and returned without running the handler;
//! when no response was recorded the call surfaces `Duplicate`. The key
//! comes from the configured extractor, falling back to the call context's
//! wire message id.

use crate::message::{CallContext, Request};
use crate::pipeline::{priority, Next, PipelineBehavior};
use async_trait::async_trait;
use metrics::counter;
use relay_common::{DispatchError, IdempotencyStore, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

type KeyFn<R> = Arc<dyn Fn(&R) -> Option<String> + Send + Sync>;

pub struct IdempotencyBehavior<R> {
    store: Arc<dyn IdempotencyStore>,
    key: KeyFn<R>,
}

impl<R: Request> IdempotencyBehavior<R> {
    /// Key every call by the context's wire message id; calls without one
    /// pass through unguarded.
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            key: Arc::new(|_| None),
        }
    }

    /// Key by a request-derived value instead.
    pub fn keyed_by(
        store: Arc<dyn IdempotencyStore>,
        key: impl Fn(&R) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            store,
            key: Arc::new(key),
        }
    }
}

fn store_error(e: StoreError) -> DispatchError {
    DispatchError::Transient(e.to_string())
}

#[async_trait]
impl<R> PipelineBehavior<R> for IdempotencyBehavior<R>
where
    R: Request,
    R::Response: Serialize + DeserializeOwned,
{
    fn priority(&self) -> i32 {
        priority::IDEMPOTENCY
    }

    async fn handle(
        &self,
        request: &R,
        next: Next<'_, R>,
        ctx: &CallContext,
    ) -> Result<R::Response, DispatchError> {
        let key = match (self.key)(request).or_else(|| ctx.message_id().map(String::from)) {
            Some(key) => key,
            None => return next.run(request, ctx).await,
        };

        if self.store.is_processed(&key).await.map_err(store_error)? {
            counter!("relay_inbox_dedup_hits_total").increment(1);
            if let Some(record) = self.store.get(&key).await.map_err(store_error)? {
                if let Some(fingerprint) = record.result_fingerprint {
                    if let Ok(response) = serde_json::from_str::<R::Response>(&fingerprint) {
                        return Ok(response);
                    }
                }
            }
            return Err(DispatchError::Duplicate(key));
        }

        let result = next.run(request, ctx).await;

        if let Ok(response) = &result {
            let fingerprint = serde_json::to_string(response).ok();
            if let Err(e) = self.store.record(&key, fingerprint).await {
                warn!(message_id = %key, error = %e, "failed to record idempotency key");
            }
        }

        result
    }
}
