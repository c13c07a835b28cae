//! Background outbox publisher.
//!
//! Polls the outbox store, claims due pending records with a lease so
//! concurrent workers never double-publish, and pushes each envelope
//! through the transport. Failures reschedule with exponential backoff;
//! records that exhaust `max_attempts` move to the dead-letter store. A
//! pending record is never silently dropped.

use chrono::Utc;
use metrics::{counter, gauge};
use rand::Rng;
use relay_common::{
    DeadLetterRecord, DeadLetterStore, MessageEnvelope, OutboxStore, StoreError,
};
use relay_config::OutboxConfig;
use relay_transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type SubjectResolver = Arc<dyn Fn(&MessageEnvelope) -> String + Send + Sync>;

pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    transport: Arc<dyn Transport>,
    config: OutboxConfig,
    /// Worker identity used for record claims.
    owner: String,
    subject_resolver: SubjectResolver,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        transport: Arc<dyn Transport>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            dead_letters,
            transport,
            config,
            owner: format!("outbox-publisher-{}", uuid::Uuid::new_v4()),
            subject_resolver: Arc::new(|envelope| envelope.message_type.clone()),
        }
    }

    /// Override the default subject (the envelope's `message_type`).
    pub fn with_subject_resolver(
        mut self,
        resolver: impl Fn(&MessageEnvelope) -> String + Send + Sync + 'static,
    ) -> Self {
        self.subject_resolver = Arc::new(resolver);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Poll loop; runs until the token is cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            owner = %self.owner,
            poll_interval_ms = self.config.polling_interval_ms,
            batch_size = self.config.batch_size,
            max_attempts = self.config.max_attempts,
            "outbox publisher started"
        );

        let mut tick = tokio::time::interval(self.config.polling_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.drain_once().await {
                        warn!(owner = %self.owner, error = %e, "outbox poll failed");
                    }
                }
            }
        }

        info!(owner = %self.owner, "outbox publisher stopped");
    }

    /// One poll cycle; returns how many records were published.
    pub async fn drain_once(&self) -> Result<u32, StoreError> {
        let claimed = self
            .store
            .claim_pending(
                self.config.batch_size,
                self.config.claim_lease(),
                &self.owner,
            )
            .await?;

        let mut published = 0u32;
        for record in claimed {
            let subject = (self.subject_resolver)(&record.envelope);

            match self.transport.send(&subject, record.envelope.clone()).await {
                Ok(()) => {
                    self.store.mark_published(&record.message_id).await?;
                    counter!("relay_outbox_published_total").increment(1);
                    published += 1;
                    debug!(
                        message_id = %record.message_id,
                        subject = %subject,
                        "outbox record published"
                    );
                }
                Err(e) => {
                    let attempt = record.attempt_count + 1;
                    if attempt >= self.config.max_attempts {
                        self.store
                            .mark_failed(&record.message_id, &e.to_string())
                            .await?;
                        self.dead_letters
                            .push(DeadLetterRecord::new(record.envelope.clone(), e.to_string()))
                            .await?;
                        counter!("relay_outbox_failed_total").increment(1);
                        warn!(
                            message_id = %record.message_id,
                            attempts = attempt,
                            error = %e,
                            "outbox record dead-lettered"
                        );
                    } else {
                        let delay = backoff_delay(
                            self.config.base_backoff(),
                            self.config.max_backoff(),
                            attempt - 1,
                        );
                        let next_attempt_at = Utc::now()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::seconds(1));
                        self.store
                            .reschedule(&record.message_id, &e.to_string(), next_attempt_at)
                            .await?;
                        debug!(
                            message_id = %record.message_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "outbox record rescheduled"
                        );
                    }
                }
            }
        }

        if let Ok(pending) = self.store.pending_count().await {
            gauge!("relay_outbox_pending").set(pending as f64);
        }

        Ok(published)
    }
}

/// `delay_i = min(max, base * 2^i + jitter[0, base/2])`.
fn backoff_delay(base: Duration, max: Duration, attempt_index: u32) -> Duration {
    let exponent = attempt_index.min(20);
    let scaled = base.saturating_mul(2u32.saturating_pow(exponent));
    let jitter_ceiling = (base / 2).max(Duration::from_millis(1));
    let jitter = rand::thread_rng().gen_range(Duration::ZERO..jitter_ceiling);
    (scaled + jitter).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);

        let first = backoff_delay(base, max, 0);
        assert!(first >= Duration::from_millis(100));
        assert!(first < Duration::from_millis(151));

        let third = backoff_delay(base, max, 2);
        assert!(third >= Duration::from_millis(400));
        assert!(third < Duration::from_millis(451));

        let capped = backoff_delay(base, max, 10);
        assert_eq!(capped, max);
    }
}
