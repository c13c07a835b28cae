//! Inbound envelope routing.
//!
//! Bridges the wire side to local dispatch: an envelope arrives from a
//! transport, its `message_type` selects a registered route, the payload is
//! decoded with the serializer matching `content_type`, and the typed
//! message goes through the local mediator. The inbox consumer drives this
//! through the `EnvelopeDispatcher` contract.

use crate::mediator::Mediator;
use crate::message::{CallContext, Event, Request};
use async_trait::async_trait;
use futures::future::BoxFuture;
use relay_common::{
    DispatchError, EnvelopeDispatcher, MessageEnvelope, SerializerRegistry,
};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

type RouteFn = Arc<
    dyn Fn(
            Arc<Mediator>,
            Arc<SerializerRegistry>,
            MessageEnvelope,
        ) -> BoxFuture<'static, Result<(), DispatchError>>
        + Send
        + Sync,
>;

pub struct EnvelopeRouter {
    mediator: Arc<Mediator>,
    serializers: Arc<SerializerRegistry>,
    routes: HashMap<String, RouteFn>,
}

impl EnvelopeRouter {
    pub fn new(mediator: Arc<Mediator>, serializers: Arc<SerializerRegistry>) -> Self {
        Self {
            mediator,
            serializers,
            routes: HashMap::new(),
        }
    }

    fn context_for(envelope: &MessageEnvelope) -> CallContext {
        let mut ctx = CallContext::new().with_message_id(envelope.message_id.clone());
        if let Some(correlation_id) = &envelope.correlation_id {
            ctx = ctx.with_correlation_id(correlation_id.clone());
        }
        ctx
    }

    /// Route envelopes of `E::name()` into a local `publish`.
    pub fn route_event<E>(mut self) -> Self
    where
        E: Event + DeserializeOwned,
    {
        let route: RouteFn = Arc::new(|mediator, serializers, envelope| {
            Box::pin(async move {
                let event: E = serializers
                    .decode_message(&envelope.content_type, &envelope.payload)
                    .map_err(DispatchError::from)?;
                let ctx = Self::context_for(&envelope);
                mediator.publish_with_ctx(event, ctx).await;
                Ok(())
            })
        });
        self.routes.insert(E::name().to_string(), route);
        self
    }

    /// Route envelopes of `R::name()` into a local `send`; the response is
    /// discarded (point-to-point command semantics).
    pub fn route_request<R>(mut self) -> Self
    where
        R: Request + DeserializeOwned,
    {
        let route: RouteFn = Arc::new(|mediator, serializers, envelope| {
            Box::pin(async move {
                let request: R = serializers
                    .decode_message(&envelope.content_type, &envelope.payload)
                    .map_err(DispatchError::from)?;
                let ctx = Self::context_for(&envelope);
                mediator.send_with_ctx(request, ctx).await.map(|_| ())
            })
        });
        self.routes.insert(R::name().to_string(), route);
        self
    }

    pub fn has_route(&self, message_type: &str) -> bool {
        self.routes.contains_key(message_type)
    }
}

#[async_trait]
impl EnvelopeDispatcher for EnvelopeRouter {
    async fn dispatch(&self, envelope: &MessageEnvelope) -> Result<(), DispatchError> {
        let route = self.routes.get(&envelope.message_type).ok_or_else(|| {
            DispatchError::Terminal(format!(
                "no route for message type {}",
                envelope.message_type
            ))
        })?;
        route(
            Arc::clone(&self.mediator),
            Arc::clone(&self.serializers),
            envelope.clone(),
        )
        .await
    }
}
