//! In-memory store implementations.
//!
//! Suitable for tests and single-process deployments; everything is
//! serialized behind a mutex, which satisfies the linearizable-store
//! contract the workers rely on.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use relay_common::{
    DeadLetterRecord, DeadLetterStore, IdempotencyRecord, IdempotencyStore, InboxRecord,
    InboxStore, MessageEnvelope, OutboxRecord, OutboxStatus, OutboxStore, StoreError,
};
use std::collections::HashMap;
use std::time::Duration;

fn chrono_from_std(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(i64::MAX / 2))
}

#[derive(Default)]
pub struct InMemoryOutboxStore {
    records: Mutex<HashMap<String, OutboxRecord>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, message_id: &str) -> Option<OutboxRecord> {
        self.records.lock().get(message_id).cloned()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, envelope: MessageEnvelope) -> Result<(), StoreError> {
        let record = OutboxRecord::new(envelope);
        self.records
            .lock()
            .insert(record.message_id.clone(), record);
        Ok(())
    }

    async fn claim_pending(
        &self,
        batch: u32,
        lease: Duration,
        owner: &str,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let now = Utc::now();
        let mut records = self.records.lock();

        let mut due: Vec<&mut OutboxRecord> = records
            .values_mut()
            .filter(|r| {
                r.status == OutboxStatus::Pending
                    && r.next_attempt_at <= now
                    && r.claim_expires_at.map_or(true, |until| until <= now)
            })
            .collect();
        due.sort_by_key(|r| r.created_at);

        let mut claimed = Vec::new();
        for record in due.into_iter().take(batch as usize) {
            record.claimed_by = Some(owner.to_string());
            record.claim_expires_at = Some(now + chrono_from_std(lease));
            claimed.push(record.clone());
        }
        Ok(claimed)
    }

    async fn mark_published(&self, message_id: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;
        if record.status == OutboxStatus::Failed {
            return Err(StoreError::IllegalTransition {
                message_id: message_id.to_string(),
                detail: "failed record cannot become published".to_string(),
            });
        }
        record.status = OutboxStatus::Published;
        record.last_attempt_at = Some(Utc::now());
        record.claimed_by = None;
        record.claim_expires_at = None;
        Ok(())
    }

    async fn mark_failed(&self, message_id: &str, error: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;
        if record.status == OutboxStatus::Published {
            return Err(StoreError::IllegalTransition {
                message_id: message_id.to_string(),
                detail: "published record cannot become failed".to_string(),
            });
        }
        record.status = OutboxStatus::Failed;
        record.last_attempt_at = Some(Utc::now());
        record.last_error = Some(error.to_string());
        record.claimed_by = None;
        record.claim_expires_at = None;
        Ok(())
    }

    async fn reschedule(
        &self,
        message_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;
        // Published -> Pending is the one transition the lifecycle forbids.
        if record.status != OutboxStatus::Pending {
            return Err(StoreError::IllegalTransition {
                message_id: message_id.to_string(),
                detail: format!("cannot reschedule a {:?} record", record.status),
            });
        }
        record.attempt_count += 1;
        record.last_attempt_at = Some(Utc::now());
        record.last_error = Some(error.to_string());
        record.next_attempt_at = next_attempt_at;
        record.claimed_by = None;
        record.claim_expires_at = None;
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.status == OutboxStatus::Pending)
            .count() as u64)
    }
}

#[derive(Default)]
pub struct InMemoryInboxStore {
    records: Mutex<HashMap<String, InboxRecord>>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, message_id: &str) -> Option<InboxRecord> {
        self.records.lock().get(message_id).cloned()
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn try_lock(
        &self,
        message_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut records = self.records.lock();

        match records.get_mut(message_id) {
            Some(record) if record.processed => Ok(false),
            Some(record) if record.locked_until > now && record.lock_owner != owner => Ok(false),
            Some(record) => {
                record.lock_owner = owner.to_string();
                record.locked_until = now + chrono_from_std(ttl);
                Ok(true)
            }
            None => {
                records.insert(
                    message_id.to_string(),
                    InboxRecord {
                        message_id: message_id.to_string(),
                        lock_owner: owner.to_string(),
                        locked_until: now + chrono_from_std(ttl),
                        processed: false,
                        processed_at: None,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn mark_processed(&self, message_id: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;
        record.processed = true;
        record.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn release(&self, message_id: &str, owner: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(message_id) {
            if !record.processed && record.lock_owner == owner {
                record.locked_until = Utc::now();
            }
        }
        Ok(())
    }

    async fn is_processed(&self, message_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .records
            .lock()
            .get(message_id)
            .map(|r| r.processed)
            .unwrap_or(false))
    }
}

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn is_processed(&self, message_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.lock().contains_key(message_id))
    }

    async fn record(
        &self,
        message_id: &str,
        result_fingerprint: Option<String>,
    ) -> Result<(), StoreError> {
        self.records.lock().insert(
            message_id.to_string(),
            IdempotencyRecord {
                message_id: message_id.to_string(),
                first_seen_at: Utc::now(),
                result_fingerprint,
            },
        );
        Ok(())
    }

    async fn get(&self, message_id: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.records.lock().get(message_id).cloned())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| record.first_seen_at >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn push(&self, record: DeadLetterRecord) -> Result<(), StoreError> {
        self.records.lock().push(record);
        Ok(())
    }

    async fn len(&self) -> Result<u64, StoreError> {
        Ok(self.records.lock().len() as u64)
    }

    async fn drain(&self, limit: u32) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let mut records = self.records.lock();
        let take = (limit as usize).min(records.len());
        Ok(records.drain(..take).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(message_id: &str) -> MessageEnvelope {
        MessageEnvelope::builder("OrderPlaced", "application/json")
            .message_id(message_id)
            .build()
    }

    #[tokio::test]
    async fn published_records_never_go_back_to_pending() {
        let store = InMemoryOutboxStore::new();
        store.enqueue(envelope("m-1")).await.unwrap();
        store.mark_published("m-1").await.unwrap();

        let rescheduled = store.reschedule("m-1", "late failure", Utc::now()).await;
        assert!(matches!(
            rescheduled,
            Err(StoreError::IllegalTransition { .. })
        ));
        let failed = store.mark_failed("m-1", "late failure").await;
        assert!(matches!(failed, Err(StoreError::IllegalTransition { .. })));
    }

    #[tokio::test]
    async fn claimed_records_are_invisible_to_other_workers() {
        let store = InMemoryOutboxStore::new();
        store.enqueue(envelope("m-1")).await.unwrap();

        let first = store
            .claim_pending(10, Duration::from_secs(30), "worker-a")
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = store
            .claim_pending(10, Duration::from_secs(30), "worker-b")
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn expired_claims_become_claimable_again() {
        let store = InMemoryOutboxStore::new();
        store.enqueue(envelope("m-1")).await.unwrap();

        store
            .claim_pending(10, Duration::from_millis(0), "worker-a")
            .await
            .unwrap();
        let reclaimed = store
            .claim_pending(10, Duration::from_secs(30), "worker-b")
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
    }

    #[tokio::test]
    async fn inbox_lock_is_exclusive_until_ttl() {
        let store = InMemoryInboxStore::new();

        assert!(store
            .try_lock("m-1", "consumer-a", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .try_lock("m-1", "consumer-b", Duration::from_secs(60))
            .await
            .unwrap());
        // Same owner refreshes its own lock.
        assert!(store
            .try_lock("m-1", "consumer-a", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_inbox_lock_is_re_lockable() {
        let store = InMemoryInboxStore::new();

        assert!(store
            .try_lock("m-1", "consumer-a", Duration::from_millis(0))
            .await
            .unwrap());
        assert!(store
            .try_lock("m-1", "consumer-b", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn processed_inbox_record_refuses_locks() {
        let store = InMemoryInboxStore::new();
        store
            .try_lock("m-1", "consumer-a", Duration::from_secs(60))
            .await
            .unwrap();
        store.mark_processed("m-1").await.unwrap();

        assert!(!store
            .try_lock("m-1", "consumer-b", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(store.is_processed("m-1").await.unwrap());
    }

    #[tokio::test]
    async fn idempotency_purge_respects_the_cutoff() {
        let store = InMemoryIdempotencyStore::new();
        store.record("old", None).await.unwrap();

        let purged = store
            .purge_older_than(Utc::now() + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(!store.is_processed("old").await.unwrap());
    }
}
