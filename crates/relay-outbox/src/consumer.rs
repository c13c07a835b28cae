//! Inbox consumer: at-most-once processing per message id.
//!
//! Plugs into a transport subscription as the delivery handler. Step order
//! is fixed: idempotency short-circuit, inbox lock, local dispatch, inbox
//! `mark_processed`, idempotency `record`, ack. The inbox flag is written
//! before the idempotency key so a crash between the two still dedups the
//! redelivery.

use async_trait::async_trait;
use metrics::counter;
use relay_common::{
    DeadLetterRecord, DeadLetterStore, EnvelopeDispatcher, IdempotencyStore, InboxStore,
    MessageEnvelope,
};
use relay_config::{InboxConfig, LockMissDisposition};
use relay_transport::{DeliveryHandler, DeliveryOutcome};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct InboxConsumer {
    inbox: Arc<dyn InboxStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    dispatcher: Arc<dyn EnvelopeDispatcher>,
    config: InboxConfig,
    /// Lock owner identity for this consumer instance.
    owner: String,
}

impl InboxConsumer {
    pub fn new(
        inbox: Arc<dyn InboxStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        dispatcher: Arc<dyn EnvelopeDispatcher>,
        config: InboxConfig,
    ) -> Self {
        Self {
            inbox,
            idempotency,
            dead_letters,
            dispatcher,
            config,
            owner: format!("inbox-consumer-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    fn nack(&self) -> DeliveryOutcome {
        DeliveryOutcome::Nack {
            delay: Some(Duration::from_secs(self.config.nack_delay_seconds as u64)),
        }
    }

    async fn dead_letter(&self, envelope: &MessageEnvelope, error: String) {
        counter!("relay_inbox_dead_lettered_total").increment(1);
        if let Err(e) = self
            .dead_letters
            .push(DeadLetterRecord::new(envelope.clone(), error))
            .await
        {
            warn!(
                message_id = %envelope.message_id,
                error = %e,
                "failed to write dead-letter record"
            );
        }
    }
}

#[async_trait]
impl DeliveryHandler for InboxConsumer {
    async fn on_delivery(&self, envelope: MessageEnvelope) -> DeliveryOutcome {
        let message_id = envelope.message_id.clone();

        // Duplicate detection is silent: ack and move on.
        match self.idempotency.is_processed(&message_id).await {
            Ok(true) => {
                counter!("relay_inbox_dedup_hits_total").increment(1);
                debug!(message_id = %message_id, "duplicate delivery skipped");
                return DeliveryOutcome::Ack;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "idempotency check failed");
                return self.nack();
            }
        }

        match self
            .inbox
            .try_lock(&message_id, &self.owner, self.config.lock_ttl())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // Processed-but-unrecorded (crash between inbox and
                // idempotency writes) counts as seen.
                if self.inbox.is_processed(&message_id).await.unwrap_or(false) {
                    counter!("relay_inbox_dedup_hits_total").increment(1);
                    return DeliveryOutcome::Ack;
                }
                return match self.config.lock_miss_disposition {
                    LockMissDisposition::Ack => DeliveryOutcome::Ack,
                    LockMissDisposition::Nack => self.nack(),
                };
            }
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "inbox lock failed");
                return self.nack();
            }
        }

        match self.dispatcher.dispatch(&envelope).await {
            Ok(()) => {
                // Inbox first, idempotency second.
                if let Err(e) = self.inbox.mark_processed(&message_id).await {
                    warn!(message_id = %message_id, error = %e, "mark_processed failed");
                    let _ = self.inbox.release(&message_id, &self.owner).await;
                    return self.nack();
                }
                if let Err(e) = self.idempotency.record(&message_id, None).await {
                    // The inbox flag already dedups redeliveries.
                    warn!(message_id = %message_id, error = %e, "idempotency record failed");
                }
                DeliveryOutcome::Ack
            }
            Err(e) if e.is_terminal() => {
                warn!(
                    message_id = %message_id,
                    kind = e.kind().as_str(),
                    error = %e,
                    "terminal dispatch failure, dead-lettering"
                );
                self.dead_letter(&envelope, e.to_string()).await;
                let _ = self.inbox.release(&message_id, &self.owner).await;
                DeliveryOutcome::Ack
            }
            Err(e) if envelope.delivery_count >= self.config.max_redeliveries => {
                warn!(
                    message_id = %message_id,
                    delivery_count = envelope.delivery_count,
                    error = %e,
                    "redeliveries exhausted, dead-lettering"
                );
                self.dead_letter(&envelope, e.to_string()).await;
                let _ = self.inbox.release(&message_id, &self.owner).await;
                DeliveryOutcome::Ack
            }
            Err(e) => {
                debug!(
                    message_id = %message_id,
                    kind = e.kind().as_str(),
                    error = %e,
                    "dispatch failed, releasing lock for redelivery"
                );
                let _ = self.inbox.release(&message_id, &self.owner).await;
                self.nack()
            }
        }
    }
}
