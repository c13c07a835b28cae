//! NATS transport.
//!
//! Core NATS semantics: subjects fan out to every subscriber, queue groups
//! give competing-consumer delivery. Delivery is at-most-once; a nack
//! cannot ask the broker for redelivery here, so deployments that need
//! at-least-once pair this transport with a durable broker configuration
//! and the outbox/inbox layer.

use crate::{
    DeliveryHandler, DeliveryOutcome, Result, SubscribeOptions, Subscription, Transport,
    TransportError,
};
use async_trait::async_trait;
use futures::StreamExt;
use relay_common::MessageEnvelope;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct NatsTransport {
    client: async_nats::Client,
    closed: AtomicBool,
    root_cancel: CancellationToken,
}

impl NatsTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        info!(url, "connected to NATS");
        Ok(Self {
            client,
            closed: AtomicBool::new(false),
            root_cancel: CancellationToken::new(),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn encode(envelope: &MessageEnvelope) -> Result<Vec<u8>> {
        serde_json::to_vec(envelope).map_err(|e| TransportError::Serialization(e.to_string()))
    }

    async fn publish_raw(&self, subject: &str, envelope: MessageEnvelope) -> Result<()> {
        self.ensure_open()?;
        let payload = Self::encode(&envelope)?;
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }
}

#[async_trait]
impl Transport for NatsTransport {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn send(&self, subject: &str, envelope: MessageEnvelope) -> Result<()> {
        // Competing-consumer semantics come from queue-group subscriptions
        // on the consumer side.
        self.publish_raw(subject, envelope).await
    }

    async fn publish(&self, subject: &str, envelope: MessageEnvelope) -> Result<()> {
        self.publish_raw(subject, envelope).await
    }

    async fn subscribe(
        &self,
        subject: &str,
        group: Option<&str>,
        _options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription> {
        self.ensure_open()?;

        let mut subscriber = match group {
            Some(group) => self
                .client
                .queue_subscribe(subject.to_string(), group.to_string())
                .await,
            None => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| TransportError::Connection(e.to_string()))?;

        let cancel = self.root_cancel.child_token();
        let worker_cancel = cancel.clone();
        let worker_subject = subject.to_string();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    next = subscriber.next() => match next {
                        Some(message) => message,
                        None => break,
                    },
                };

                let envelope: MessageEnvelope = match serde_json::from_slice(&message.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(subject = %worker_subject, error = %e, "undecodable NATS message dropped");
                        continue;
                    }
                };

                match handler.on_delivery(envelope).await {
                    DeliveryOutcome::Ack | DeliveryOutcome::Term => {}
                    DeliveryOutcome::Nack { .. } => {
                        // Core NATS has no broker-side redelivery to ask for.
                        warn!(
                            subject = %worker_subject,
                            "nack on core NATS delivery; message is not redelivered"
                        );
                    }
                }
            }
            if let Err(e) = subscriber.unsubscribe().await {
                debug!(subject = %worker_subject, error = %e, "unsubscribe failed");
            }
        });

        Ok(Subscription::new(subject.to_string(), cancel))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        // Push buffered publishes out before stopping the delivery loops.
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "flush on close failed");
        }
        self.root_cancel.cancel();
        Ok(())
    }
}
