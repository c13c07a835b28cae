//! Staging helper for outgoing messages.
//!
//! Encodes a typed message into an envelope and writes it to the outbox as
//! `Pending`. The host calls this inside the same logical unit of work as
//! its business state change; the background publisher takes it from there.

use relay_common::{DispatchError, MessageEnvelope, OutboxStore, SerializerRegistry};
use relay_common::CONTENT_TYPE_JSON;
use serde::Serialize;
use std::sync::Arc;

pub struct OutboxSender {
    store: Arc<dyn OutboxStore>,
    serializers: Arc<SerializerRegistry>,
    content_type: String,
}

impl OutboxSender {
    pub fn new(store: Arc<dyn OutboxStore>, serializers: Arc<SerializerRegistry>) -> Self {
        Self {
            store,
            serializers,
            content_type: CONTENT_TYPE_JSON.to_string(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Stage a message; returns the generated message id.
    pub async fn enqueue<M: Serialize>(
        &self,
        message_type: &str,
        message: &M,
    ) -> Result<String, DispatchError> {
        self.enqueue_correlated(message_type, message, None).await
    }

    pub async fn enqueue_correlated<M: Serialize>(
        &self,
        message_type: &str,
        message: &M,
        correlation_id: Option<&str>,
    ) -> Result<String, DispatchError> {
        let payload = self
            .serializers
            .encode_message(&self.content_type, message)?;

        let mut builder =
            MessageEnvelope::builder(message_type, &self.content_type).payload(payload);
        if let Some(correlation_id) = correlation_id {
            builder = builder.correlation_id(correlation_id);
        }
        let envelope = builder.build();
        let message_id = envelope.message_id.clone();

        self.store
            .enqueue(envelope)
            .await
            .map_err(|e| DispatchError::Transient(e.to_string()))?;

        Ok(message_id)
    }
}
