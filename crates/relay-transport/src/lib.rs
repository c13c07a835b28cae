//! Pluggable message transport.
//!
//! One surface over multiple substrates: `send` is point-to-point into a
//! competing-consumer pool, `publish` fans out, `subscribe` attaches a
//! delivery handler with a bounded queue and a configurable overflow mode.
//! Implementations declare their own delivery semantics; the in-memory
//! transport is at-most-once on its own and exactly-once when paired with
//! the outbox/inbox layer in the same process.

pub mod batching;
pub mod compression;
pub mod error;
pub mod memory;

#[cfg(feature = "nats")]
pub mod nats;

#[cfg(feature = "redis")]
pub mod redis;

pub use batching::BatchingTransport;
pub use compression::CompressedTransport;
pub use error::TransportError;
pub use memory::InMemoryTransport;

use async_trait::async_trait;
use relay_common::MessageEnvelope;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, TransportError>;

/// What the subscriber tells the transport about one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Done; the message is consumed.
    Ack,
    /// Redeliver after an optional delay.
    Nack { delay: Option<Duration> },
    /// Terminal; consume without retrying.
    Term,
}

/// Per-delivery callback attached by `subscribe`.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn on_delivery(&self, envelope: MessageEnvelope) -> DeliveryOutcome;
}

/// Behavior when a subscriber's bounded queue is full.
#[derive(Debug, Clone, Copy)]
pub enum Overflow {
    /// Block the producer up to the timeout, then fail.
    Block { timeout: Duration },
    /// Fail immediately with backpressure.
    Reject,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub queue_capacity: usize,
    pub overflow: Overflow,
    /// Redeliveries after which a nacked message is dropped instead of
    /// looping forever (in-memory transport only; brokers enforce their
    /// own limit).
    pub max_redeliveries: u32,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            overflow: Overflow::Block {
                timeout: Duration::from_secs(5),
            },
            max_redeliveries: 10,
        }
    }
}

/// Handle to an active subscription; cancelling stops the delivery loop.
pub struct Subscription {
    subject: String,
    cancel: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(subject: String, cancel: CancellationToken) -> Self {
        Self { subject, cancel }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Point-to-point: consumed by exactly one subscriber in the subject's
    /// competing-consumer pool.
    async fn send(&self, subject: &str, envelope: MessageEnvelope) -> Result<()>;

    /// Fan-out to every subscriber (one member per competing group).
    async fn publish(&self, subject: &str, envelope: MessageEnvelope) -> Result<()>;

    async fn subscribe(
        &self,
        subject: &str,
        group: Option<&str>,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription>;

    /// Batched send. The default forwards sequentially with no atomicity;
    /// implementations that can enqueue all-or-nothing override this.
    async fn send_batch(&self, subject: &str, envelopes: Vec<MessageEnvelope>) -> Result<()> {
        for envelope in envelopes {
            self.send(subject, envelope).await?;
        }
        Ok(())
    }

    /// Graceful shutdown: refuse new sends, drain in-flight deliveries up
    /// to the implementation's deadline, then force-close.
    async fn close(&self) -> Result<()>;
}
