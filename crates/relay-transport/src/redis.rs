//! Redis Streams transport.
//!
//! Every subject is a stream. `send`/`publish` XADD the JSON-encoded
//! envelope; grouped subscriptions read through XREADGROUP for competing
//! delivery and XACK on ack, so semantics are at-least-once per group.
//! Ungrouped subscriptions tail the stream independently (fan-out).
//! Nacked deliveries stay in the group's pending entries list for the
//! deployment's reclaim tooling (XAUTOCLAIM) to pick up.

use crate::{
    DeliveryHandler, DeliveryOutcome, Result, SubscribeOptions, Subscription, Transport,
    TransportError,
};
use async_trait::async_trait;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use relay_common::MessageEnvelope;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PAYLOAD_FIELD: &str = "data";
const READ_COUNT: usize = 16;
const BLOCK_MS: usize = 1_000;

pub struct RedisStreamsTransport {
    manager: redis::aio::ConnectionManager,
    closed: AtomicBool,
    root_cancel: CancellationToken,
    consumer_seq: AtomicU64,
}

impl RedisStreamsTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| TransportError::Config(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        info!(url, "connected to Redis");
        Ok(Self {
            manager,
            closed: AtomicBool::new(false),
            root_cancel: CancellationToken::new(),
            consumer_seq: AtomicU64::new(0),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn append(&self, subject: &str, envelope: MessageEnvelope) -> Result<()> {
        self.ensure_open()?;
        let payload =
            serde_json::to_vec(&envelope).map_err(|e| TransportError::Serialization(e.to_string()))?;
        let mut conn = self.manager.clone();
        let _: String = conn
            .xadd(subject, "*", &[(PAYLOAD_FIELD, payload)])
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn ensure_group(&self, subject: &str, group: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let created: std::result::Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(subject, group, "$").await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(TransportError::Connection(e.to_string())),
        }
    }

    fn decode_entry(map: &std::collections::HashMap<String, redis::Value>) -> Option<MessageEnvelope> {
        let raw: Vec<u8> = map
            .get(PAYLOAD_FIELD)
            .and_then(|value| redis::from_redis_value(value).ok())?;
        serde_json::from_slice(&raw).ok()
    }
}

#[async_trait]
impl Transport for RedisStreamsTransport {
    fn name(&self) -> &'static str {
        "redis-streams"
    }

    async fn send(&self, subject: &str, envelope: MessageEnvelope) -> Result<()> {
        self.append(subject, envelope).await
    }

    async fn publish(&self, subject: &str, envelope: MessageEnvelope) -> Result<()> {
        self.append(subject, envelope).await
    }

    async fn subscribe(
        &self,
        subject: &str,
        group: Option<&str>,
        _options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription> {
        self.ensure_open()?;

        let consumer = format!(
            "relay-{}-{}",
            std::process::id(),
            self.consumer_seq.fetch_add(1, Ordering::SeqCst)
        );
        if let Some(group) = group {
            self.ensure_group(subject, group).await?;
        }

        let cancel = self.root_cancel.child_token();
        let worker_cancel = cancel.clone();
        let mut conn = self.manager.clone();
        let subject_owned = subject.to_string();
        let group_owned = group.map(String::from);

        tokio::spawn(async move {
            // Ungrouped readers tail from "now"; grouped readers use the
            // group cursor (">").
            let mut last_id = "$".to_string();

            loop {
                if worker_cancel.is_cancelled() {
                    break;
                }

                let options = match &group_owned {
                    Some(group) => StreamReadOptions::default()
                        .group(group.as_str(), consumer.as_str())
                        .count(READ_COUNT)
                        .block(BLOCK_MS),
                    None => StreamReadOptions::default().count(READ_COUNT).block(BLOCK_MS),
                };
                let ids = match &group_owned {
                    Some(_) => vec![">".to_string()],
                    None => vec![last_id.clone()],
                };

                let reply: StreamReadReply = match conn
                    .xread_options(&[subject_owned.as_str()], &ids, &options)
                    .await
                {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(subject = %subject_owned, error = %e, "stream read failed");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };

                for key in reply.keys {
                    for entry in key.ids {
                        if group_owned.is_none() {
                            last_id = entry.id.clone();
                        }

                        let Some(envelope) = Self::decode_entry(&entry.map) else {
                            warn!(
                                subject = %subject_owned,
                                stream_id = %entry.id,
                                "undecodable stream entry skipped"
                            );
                            continue;
                        };

                        let outcome = handler.on_delivery(envelope).await;
                        if let Some(group) = &group_owned {
                            match outcome {
                                DeliveryOutcome::Ack | DeliveryOutcome::Term => {
                                    let acked: std::result::Result<i64, redis::RedisError> = conn
                                        .xack(subject_owned.as_str(), group.as_str(), &[&entry.id])
                                        .await;
                                    if let Err(e) = acked {
                                        warn!(
                                            subject = %subject_owned,
                                            stream_id = %entry.id,
                                            error = %e,
                                            "ack failed"
                                        );
                                    }
                                }
                                DeliveryOutcome::Nack { .. } => {
                                    // Left in the pending entries list; the
                                    // broker-side reclaim redelivers it.
                                    debug!(
                                        subject = %subject_owned,
                                        stream_id = %entry.id,
                                        "delivery nacked, left pending"
                                    );
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(subject.to_string(), cancel))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.root_cancel.cancel();
        Ok(())
    }
}
