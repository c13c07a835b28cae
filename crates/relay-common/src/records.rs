//! Durable records for the reliability layer.

use crate::envelope::MessageEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outbox record lifecycle. `Pending -> Published` is one-way; a published
/// record never becomes pending again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::Failed)
    }
}

impl Default for OutboxStatus {
    fn default() -> Self {
        OutboxStatus::Pending
    }
}

/// Outgoing message staged in the same unit of work as the business write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub message_id: String,
    pub envelope: MessageEnvelope,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Earliest instant the publisher may try again (backoff scheduling).
    pub next_attempt_at: DateTime<Utc>,
    /// Worker currently holding the publish lease, if any.
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn new(envelope: MessageEnvelope) -> Self {
        let now = Utc::now();
        Self {
            message_id: envelope.message_id.clone(),
            envelope,
            status: OutboxStatus::Pending,
            created_at: now,
            last_attempt_at: None,
            attempt_count: 0,
            last_error: None,
            next_attempt_at: now,
            claimed_by: None,
            claim_expires_at: None,
        }
    }
}

/// Inbound lock + processed flag for one message id.
///
/// `try_lock` creates the record with a TTL; if the consumer does not mark
/// it processed before `locked_until`, the record becomes re-lockable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxRecord {
    pub message_id: String,
    pub lock_owner: String,
    pub locked_until: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Written after successful processing; consulted before the inbox lock to
/// short-circuit duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub message_id: String,
    pub first_seen_at: DateTime<Utc>,
    /// Serialized response of the original invocation, when recorded.
    pub result_fingerprint: Option<String>,
}

/// Terminal failure destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub envelope: MessageEnvelope,
    pub terminal_error: String,
    pub failed_at: DateTime<Utc>,
    pub delivery_count: u32,
}

impl DeadLetterRecord {
    pub fn new(envelope: MessageEnvelope, terminal_error: impl Into<String>) -> Self {
        let delivery_count = envelope.delivery_count;
        Self {
            envelope,
            terminal_error: terminal_error.into(),
            failed_at: Utc::now(),
            delivery_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_outbox_record_is_pending_and_due() {
        let env = MessageEnvelope::builder("OrderPlaced", "application/json").build();
        let record = OutboxRecord::new(env);
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.attempt_count, 0);
        assert!(record.next_attempt_at <= Utc::now());
        assert!(record.claimed_by.is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!OutboxStatus::Pending.is_terminal());
        assert!(OutboxStatus::Published.is_terminal());
        assert!(OutboxStatus::Failed.is_terminal());
    }
}
