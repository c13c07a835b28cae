//! Abstract contracts for the durable stores backing outbox, inbox,
//! idempotency and dead-letter capture.
//!
//! The core treats every store as a linearizable black box; concrete
//! persistence (Redis, SQL, broker-native) lives outside this workspace.

use crate::envelope::MessageEnvelope;
use crate::error::DispatchError;
use crate::records::{DeadLetterRecord, IdempotencyRecord, OutboxRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("record not found: {0}")]
    NotFound(String),

    /// State transition the record's lifecycle forbids, e.g. re-pending a
    /// published outbox record.
    #[error("illegal transition for {message_id}: {detail}")]
    IllegalTransition { message_id: String, detail: String },
}

/// Durable staging for outgoing messages.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Stage an envelope as `Pending`. The host calls this inside the same
    /// logical unit of work as its business write.
    async fn enqueue(&self, envelope: MessageEnvelope) -> Result<(), StoreError>;

    /// Claim up to `batch` due pending records with a lease. A record
    /// claimed by one worker is invisible to others until the lease
    /// expires, so two workers never publish the same record.
    async fn claim_pending(
        &self,
        batch: u32,
        lease: Duration,
        owner: &str,
    ) -> Result<Vec<OutboxRecord>, StoreError>;

    async fn mark_published(&self, message_id: &str) -> Result<(), StoreError>;

    async fn mark_failed(&self, message_id: &str, error: &str) -> Result<(), StoreError>;

    /// Record a failed attempt and schedule the next one; releases the claim.
    async fn reschedule(
        &self,
        message_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn pending_count(&self) -> Result<u64, StoreError>;
}

/// Durable dedup lock for incoming messages.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Returns `true` when this owner now holds the lock. `false` means the
    /// record is locked by a live peer or already processed.
    async fn try_lock(
        &self,
        message_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn mark_processed(&self, message_id: &str) -> Result<(), StoreError>;

    /// Release an unprocessed lock so the broker's redelivery can retry.
    async fn release(&self, message_id: &str, owner: &str) -> Result<(), StoreError>;

    async fn is_processed(&self, message_id: &str) -> Result<bool, StoreError>;
}

/// Records which message ids completed successfully.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn is_processed(&self, message_id: &str) -> Result<bool, StoreError>;

    async fn record(
        &self,
        message_id: &str,
        result_fingerprint: Option<String>,
    ) -> Result<(), StoreError>;

    async fn get(&self, message_id: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Drop records first seen before `cutoff`; returns how many were purged.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn push(&self, record: DeadLetterRecord) -> Result<(), StoreError>;

    async fn len(&self) -> Result<u64, StoreError>;

    async fn drain(&self, limit: u32) -> Result<Vec<DeadLetterRecord>, StoreError>;
}

/// Hook the inbox consumer uses to hand a decoded-side envelope to local
/// dispatch. The mediator crate provides the routing implementation.
#[async_trait]
pub trait EnvelopeDispatcher: Send + Sync {
    async fn dispatch(&self, envelope: &MessageEnvelope) -> Result<(), DispatchError>;
}
