//! Send batching decorator.
//!
//! Buffers point-to-point sends per subject and flushes through the inner
//! transport's `send_batch` when the batch fills or the timeout elapses.
//! Flush failures are logged, not returned: callers that need delivery
//! guarantees pair the transport with the outbox, which retries from
//! durable state.

use crate::{
    DeliveryHandler, Result, SubscribeOptions, Subscription, Transport, TransportError,
};
use async_trait::async_trait;
use relay_common::MessageEnvelope;
use relay_config::TransportConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct BatchingTransport {
    inner: Arc<dyn Transport>,
    tx: mpsc::Sender<(String, MessageEnvelope)>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl BatchingTransport {
    pub fn new(inner: Arc<dyn Transport>, config: &TransportConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<(String, MessageEnvelope)>(4_096);
        let cancel = CancellationToken::new();

        let batch_size = config.batch_size.max(1) as usize;
        let batch_timeout = config.batch_timeout();
        let flusher_inner = Arc::clone(&inner);
        let flusher_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut buffers: HashMap<String, Vec<MessageEnvelope>> = HashMap::new();
            let mut tick = tokio::time::interval(batch_timeout);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = flusher_cancel.cancelled() => break,
                    _ = tick.tick() => {
                        for (subject, batch) in buffers.drain() {
                            Self::flush(&flusher_inner, &subject, batch).await;
                        }
                    }
                    received = rx.recv() => {
                        let Some((subject, envelope)) = received else { break };
                        let batch = buffers.entry(subject.clone()).or_default();
                        batch.push(envelope);
                        if batch.len() >= batch_size {
                            let batch = buffers.remove(&subject).unwrap_or_default();
                            Self::flush(&flusher_inner, &subject, batch).await;
                        }
                    }
                }
            }

            // Final drain on shutdown.
            while let Ok((subject, envelope)) = rx.try_recv() {
                buffers.entry(subject).or_default().push(envelope);
            }
            for (subject, batch) in buffers.drain() {
                Self::flush(&flusher_inner, &subject, batch).await;
            }
        });

        Self {
            inner,
            tx,
            cancel,
            closed: AtomicBool::new(false),
        }
    }

    async fn flush(inner: &Arc<dyn Transport>, subject: &str, batch: Vec<MessageEnvelope>) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        if let Err(e) = inner.send_batch(subject, batch).await {
            warn!(subject, count, error = %e, "batch flush failed");
        }
    }
}

#[async_trait]
impl Transport for BatchingTransport {
    fn name(&self) -> &'static str {
        "batching"
    }

    async fn send(&self, subject: &str, envelope: MessageEnvelope) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send((subject.to_string(), envelope))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Fan-out is latency-sensitive; it bypasses batching.
    async fn publish(&self, subject: &str, envelope: MessageEnvelope) -> Result<()> {
        self.inner.publish(subject, envelope).await
    }

    async fn subscribe(
        &self,
        subject: &str,
        group: Option<&str>,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription> {
        self.inner.subscribe(subject, group, options, handler).await
    }

    async fn send_batch(&self, subject: &str, envelopes: Vec<MessageEnvelope>) -> Result<()> {
        self.inner.send_batch(subject, envelopes).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.inner.close().await
    }
}
