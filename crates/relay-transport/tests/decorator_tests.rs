//! Decorator transport tests: compression and batching over the in-memory
//! transport, plus subscription lifecycle.

use async_trait::async_trait;
use relay_common::MessageEnvelope;
use relay_config::{CompressionAlgorithm, CompressionConfig, TransportConfig};
use relay_transport::{
    BatchingTransport, CompressedTransport, DeliveryHandler, DeliveryOutcome, InMemoryTransport,
    SubscribeOptions, Transport,
};
use std::sync::Arc;
use std::time::Duration;

struct Captures {
    payloads: Arc<parking_lot::Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl DeliveryHandler for Captures {
    async fn on_delivery(&self, envelope: MessageEnvelope) -> DeliveryOutcome {
        self.payloads.lock().push(envelope.payload.to_vec());
        DeliveryOutcome::Ack
    }
}

fn envelope(payload: Vec<u8>) -> MessageEnvelope {
    MessageEnvelope::builder("Sample", "application/json")
        .payload(payload)
        .build()
}

#[tokio::test]
async fn compressed_transport_is_transparent_end_to_end() {
    let inner = Arc::new(InMemoryTransport::new());
    let transport = CompressedTransport::new(
        inner,
        CompressionConfig {
            enabled: true,
            algorithm: CompressionAlgorithm::Gzip,
            threshold_bytes: 64,
        },
    );

    let payloads = Arc::new(parking_lot::Mutex::new(Vec::new()));
    transport
        .subscribe(
            "bulk",
            Some("workers"),
            SubscribeOptions::default(),
            Arc::new(Captures {
                payloads: payloads.clone(),
            }),
        )
        .await
        .unwrap();

    let body = vec![b'x'; 4096];
    transport.send("bulk", envelope(body.clone())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The handler sees the original bytes, not the compressed form.
    assert_eq!(payloads.lock().as_slice(), &[body]);
}

#[tokio::test]
async fn batching_transport_flushes_on_size() {
    let inner = Arc::new(InMemoryTransport::new());
    let payloads = Arc::new(parking_lot::Mutex::new(Vec::new()));
    inner
        .subscribe(
            "orders",
            Some("workers"),
            SubscribeOptions::default(),
            Arc::new(Captures {
                payloads: payloads.clone(),
            }),
        )
        .await
        .unwrap();

    let transport = BatchingTransport::new(
        inner,
        &TransportConfig {
            batch_size: 3,
            batch_timeout_ms: 10_000,
            ..TransportConfig::default()
        },
    );

    for i in 0..3u8 {
        transport.send("orders", envelope(vec![i])).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The full batch arrived without waiting for the timeout.
    assert_eq!(payloads.lock().len(), 3);
}

#[tokio::test]
async fn batching_transport_flushes_on_timeout() {
    let inner = Arc::new(InMemoryTransport::new());
    let payloads = Arc::new(parking_lot::Mutex::new(Vec::new()));
    inner
        .subscribe(
            "orders",
            Some("workers"),
            SubscribeOptions::default(),
            Arc::new(Captures {
                payloads: payloads.clone(),
            }),
        )
        .await
        .unwrap();

    let transport = BatchingTransport::new(
        inner,
        &TransportConfig {
            batch_size: 100,
            batch_timeout_ms: 20,
            ..TransportConfig::default()
        },
    );

    transport.send("orders", envelope(vec![1])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(payloads.lock().len(), 1);
}

#[tokio::test]
async fn unsubscribed_consumer_stops_receiving() {
    let transport = InMemoryTransport::new();
    let payloads = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let subscription = transport
        .subscribe(
            "orders",
            Some("workers"),
            SubscribeOptions::default(),
            Arc::new(Captures {
                payloads: payloads.clone(),
            }),
        )
        .await
        .unwrap();
    assert!(subscription.is_active());

    transport.send("orders", envelope(vec![1])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    subscription.unsubscribe();
    assert!(!subscription.is_active());
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The entry is pruned: point-to-point now has no consumers.
    let result = transport.send("orders", envelope(vec![2])).await;
    assert!(result.is_err());
    assert_eq!(payloads.lock().len(), 1);
}
