//! Wire-form message envelope.
//!
//! Field names are camelCase on the wire so mixed-language consumers can
//! share subjects with this stack.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One message in transit.
///
/// Every field except `delivery_count` is fixed at construction time; the
/// delivery count is bumped by transports on redelivery via
/// [`MessageEnvelope::redelivered`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// Globally unique id, the dedup key for the inbox and idempotency stores.
    pub message_id: String,
    /// Propagated through causally related messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Fully-qualified logical type used to locate handlers.
    pub message_type: String,
    /// Selects the serializer for `payload` (e.g. `application/json`).
    pub content_type: String,
    /// Opaque serialized body.
    pub payload: Bytes,
    /// Free-form metadata; tracing context travels here.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    /// Incremented on each redelivery, starts at zero.
    #[serde(default)]
    pub delivery_count: u32,
}

impl MessageEnvelope {
    pub fn builder(
        message_type: impl Into<String>,
        content_type: impl Into<String>,
    ) -> EnvelopeBuilder {
        EnvelopeBuilder {
            message_id: None,
            correlation_id: None,
            message_type: message_type.into(),
            content_type: content_type.into(),
            payload: Bytes::new(),
            headers: HashMap::new(),
        }
    }

    /// Copy of this envelope with the delivery count incremented.
    pub fn redelivered(&self) -> Self {
        let mut next = self.clone();
        next.delivery_count += 1;
        next
    }

    /// Header value lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Builder for [`MessageEnvelope`]; fills in id and timestamp at `build`.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    message_id: Option<String>,
    correlation_id: Option<String>,
    message_type: String,
    content_type: String,
    payload: Bytes,
    headers: HashMap<String, String>,
}

impl EnvelopeBuilder {
    /// Override the generated message id (tests, replay tooling).
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> MessageEnvelope {
        MessageEnvelope {
            message_id: self
                .message_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            correlation_id: self.correlation_id,
            message_type: self.message_type,
            content_type: self.content_type,
            payload: self.payload,
            headers: self.headers,
            timestamp: Utc::now(),
            delivery_count: 0,
        }
    }
}
