//! In-process channel transport.
//!
//! Each subscription gets a bounded `mpsc` queue drained by its own worker
//! task. `publish` fans out to every ungrouped subscriber and one member of
//! each competing group; `send` delivers to exactly one subscriber on the
//! subject. Nacked deliveries are re-enqueued with an incremented delivery
//! count after the requested delay, up to the subscription's redelivery cap.
//!
//! Delivery is at-most-once on its own: a message enqueued to a subscriber
//! that never processes it is lost on shutdown. Pair with the outbox/inbox
//! layer for exactly-once processing.

use crate::{
    DeliveryHandler, DeliveryOutcome, Overflow, Result, SubscribeOptions, Subscription,
    Transport, TransportError,
};
use async_trait::async_trait;
use dashmap::DashMap;
use relay_common::MessageEnvelope;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DRAIN_POLL: Duration = Duration::from_millis(10);

struct SubEntry {
    id: u64,
    group: Option<String>,
    tx: mpsc::Sender<MessageEnvelope>,
    overflow: Overflow,
    cancel: CancellationToken,
}

impl SubEntry {
    fn is_dead(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

pub struct InMemoryTransport {
    subscriptions: DashMap<String, Vec<Arc<SubEntry>>>,
    /// Round-robin cursors: per subject for `send`, per (subject, group)
    /// for grouped `publish` delivery.
    cursors: DashMap<String, AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    closed: AtomicBool,
    next_id: AtomicU64,
    /// How long `close` waits for in-flight deliveries to drain.
    drain_deadline: Duration,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            cursors: DashMap::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            drain_deadline: Duration::from_secs(5),
        }
    }

    pub fn with_drain_deadline(mut self, deadline: Duration) -> Self {
        self.drain_deadline = deadline;
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn live_entries(&self, subject: &str) -> Vec<Arc<SubEntry>> {
        let Some(mut entries) = self.subscriptions.get_mut(subject) else {
            return Vec::new();
        };
        entries.retain(|e| !e.is_dead());
        entries.clone()
    }

    fn next_cursor(&self, key: String, len: usize) -> usize {
        let cursor = self
            .cursors
            .entry(key)
            .or_insert_with(|| AtomicUsize::new(0));
        cursor.fetch_add(1, Ordering::Relaxed) % len
    }

    async fn deliver(&self, entry: &SubEntry, envelope: MessageEnvelope) -> Result<()> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = match entry.overflow {
            Overflow::Reject => entry.tx.try_send(envelope).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            }),
            Overflow::Block { timeout } => entry
                .tx
                .send_timeout(envelope, timeout)
                .await
                .map_err(|e| match e {
                    mpsc::error::SendTimeoutError::Timeout(_) => TransportError::Backpressure,
                    mpsc::error::SendTimeoutError::Closed(_) => TransportError::Closed,
                }),
        };
        if result.is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn send(&self, subject: &str, envelope: MessageEnvelope) -> Result<()> {
        self.ensure_open()?;

        let entries = self.live_entries(subject);
        if entries.is_empty() {
            // Let the outbox publisher treat this as retryable instead of
            // silently dropping the message.
            return Err(TransportError::NoConsumers(subject.to_string()));
        }

        let index = self.next_cursor(subject.to_string(), entries.len());
        self.deliver(&entries[index], envelope).await
    }

    async fn publish(&self, subject: &str, envelope: MessageEnvelope) -> Result<()> {
        self.ensure_open()?;

        let entries = self.live_entries(subject);
        if entries.is_empty() {
            // Fan-out to zero subscribers is a no-op.
            return Ok(());
        }

        let mut groups: Vec<&str> = entries
            .iter()
            .filter_map(|e| e.group.as_deref())
            .collect();
        groups.sort_unstable();
        groups.dedup();

        for entry in entries.iter().filter(|e| e.group.is_none()) {
            self.deliver(entry, envelope.clone()).await?;
        }

        for group in groups {
            let members: Vec<&Arc<SubEntry>> = entries
                .iter()
                .filter(|e| e.group.as_deref() == Some(group))
                .collect();
            let index = self.next_cursor(format!("{subject}:{group}"), members.len());
            self.deliver(members[index], envelope.clone()).await?;
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        group: Option<&str>,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription> {
        self.ensure_open()?;

        let (tx, mut rx) = mpsc::channel::<MessageEnvelope>(options.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let entry = Arc::new(SubEntry {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            group: group.map(String::from),
            tx: tx.clone(),
            overflow: options.overflow,
            cancel: cancel.clone(),
        });

        self.subscriptions
            .entry(subject.to_string())
            .or_default()
            .push(entry.clone());

        debug!(
            subject,
            group = group.unwrap_or(""),
            subscription = entry.id,
            "subscription attached"
        );

        let worker_cancel = cancel.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let max_redeliveries = options.max_redeliveries;
        let worker_subject = subject.to_string();
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };

                let outcome = handler.on_delivery(envelope.clone()).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);

                if let DeliveryOutcome::Nack { delay } = outcome {
                    if envelope.delivery_count >= max_redeliveries {
                        warn!(
                            subject = %worker_subject,
                            message_id = %envelope.message_id,
                            delivery_count = envelope.delivery_count,
                            "redelivery cap reached, dropping message"
                        );
                        continue;
                    }
                    let redelivery = envelope.redelivered();
                    let requeue = tx.clone();
                    let requeue_in_flight = Arc::clone(&in_flight);
                    tokio::spawn(async move {
                        if let Some(delay) = delay {
                            tokio::time::sleep(delay).await;
                        }
                        requeue_in_flight.fetch_add(1, Ordering::SeqCst);
                        if requeue.send(redelivery).await.is_err() {
                            requeue_in_flight.fetch_sub(1, Ordering::SeqCst);
                        }
                    });
                }
            }
        });

        Ok(Subscription::new(subject.to_string(), cancel))
    }

    /// All-or-nothing: capacity for the whole batch is not reserved, but a
    /// failed delivery aborts before any later envelope is enqueued, and
    /// nothing is enqueued when the subject has no consumers.
    async fn send_batch(&self, subject: &str, envelopes: Vec<MessageEnvelope>) -> Result<()> {
        self.ensure_open()?;
        if self.live_entries(subject).is_empty() {
            return Err(TransportError::NoConsumers(subject.to_string()));
        }
        for envelope in envelopes {
            self.send(subject, envelope).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);

        // Drain: wait for queued deliveries to be handled, then stop the
        // workers.
        let deadline = Instant::now() + self.drain_deadline;
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        for entry in self.subscriptions.iter() {
            for sub in entry.value() {
                sub.cancel.cancel();
            }
        }
        self.subscriptions.clear();

        Ok(())
    }
}
