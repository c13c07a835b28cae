//! Payload compression decorator.
//!
//! Wraps any transport: outgoing payloads at or above the configured
//! threshold are compressed and tagged with a `content-encoding` header;
//! deliveries with that header are transparently decoded before reaching
//! the subscriber's handler.

use crate::{
    DeliveryHandler, DeliveryOutcome, Result, SubscribeOptions, Subscription, Transport,
    TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use relay_common::MessageEnvelope;
use relay_config::{CompressionAlgorithm, CompressionConfig};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

pub const CONTENT_ENCODING_HEADER: &str = "content-encoding";

fn encoding_tag(algorithm: CompressionAlgorithm) -> &'static str {
    match algorithm {
        CompressionAlgorithm::Gzip => "gzip",
        CompressionAlgorithm::Brotli => "br",
        CompressionAlgorithm::Lz4 => "lz4",
    }
}

fn compress_bytes(algorithm: CompressionAlgorithm, payload: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(payload)
                .and_then(|_| encoder.finish())
                .map_err(|e| TransportError::Encoding(e.to_string()))
        }
        CompressionAlgorithm::Brotli => {
            let mut out = Vec::new();
            let params = brotli::enc::BrotliEncoderParams::default();
            brotli::BrotliCompress(&mut &payload[..], &mut out, &params)
                .map_err(|e| TransportError::Encoding(e.to_string()))?;
            Ok(out)
        }
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(payload)),
    }
}

fn decompress_bytes(tag: &str, payload: &[u8]) -> Result<Vec<u8>> {
    match tag {
        "gzip" => {
            let mut decoder = flate2::read::GzDecoder::new(payload);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| TransportError::Encoding(e.to_string()))?;
            Ok(out)
        }
        "br" => {
            let mut out = Vec::new();
            brotli::BrotliDecompress(&mut &payload[..], &mut out)
                .map_err(|e| TransportError::Encoding(e.to_string()))?;
            Ok(out)
        }
        "lz4" => lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| TransportError::Encoding(e.to_string())),
        other => Err(TransportError::Encoding(format!(
            "unknown content-encoding: {other}"
        ))),
    }
}

fn maybe_compress(config: &CompressionConfig, envelope: MessageEnvelope) -> Result<MessageEnvelope> {
    if !config.enabled
        || envelope.payload.len() < config.threshold_bytes
        || envelope.header(CONTENT_ENCODING_HEADER).is_some()
    {
        return Ok(envelope);
    }

    let compressed = compress_bytes(config.algorithm, &envelope.payload)?;
    debug!(
        message_id = %envelope.message_id,
        original = envelope.payload.len(),
        compressed = compressed.len(),
        "payload compressed"
    );

    let mut out = envelope;
    out.payload = Bytes::from(compressed);
    out.headers.insert(
        CONTENT_ENCODING_HEADER.to_string(),
        encoding_tag(config.algorithm).to_string(),
    );
    Ok(out)
}

fn maybe_decompress(envelope: MessageEnvelope) -> Result<MessageEnvelope> {
    let Some(tag) = envelope.header(CONTENT_ENCODING_HEADER).map(String::from) else {
        return Ok(envelope);
    };

    let decoded = decompress_bytes(&tag, &envelope.payload)?;
    let mut out = envelope;
    out.payload = Bytes::from(decoded);
    out.headers.remove(CONTENT_ENCODING_HEADER);
    Ok(out)
}

struct DecompressingHandler {
    inner: Arc<dyn DeliveryHandler>,
}

#[async_trait]
impl DeliveryHandler for DecompressingHandler {
    async fn on_delivery(&self, envelope: MessageEnvelope) -> DeliveryOutcome {
        match maybe_decompress(envelope) {
            Ok(envelope) => self.inner.on_delivery(envelope).await,
            // An undecodable payload never gets better on redelivery.
            Err(_) => DeliveryOutcome::Term,
        }
    }
}

pub struct CompressedTransport {
    inner: Arc<dyn Transport>,
    config: CompressionConfig,
}

impl CompressedTransport {
    pub fn new(inner: Arc<dyn Transport>, config: CompressionConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl Transport for CompressedTransport {
    fn name(&self) -> &'static str {
        "compressed"
    }

    async fn send(&self, subject: &str, envelope: MessageEnvelope) -> Result<()> {
        let envelope = maybe_compress(&self.config, envelope)?;
        self.inner.send(subject, envelope).await
    }

    async fn publish(&self, subject: &str, envelope: MessageEnvelope) -> Result<()> {
        let envelope = maybe_compress(&self.config, envelope)?;
        self.inner.publish(subject, envelope).await
    }

    async fn subscribe(
        &self,
        subject: &str,
        group: Option<&str>,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription> {
        let handler = Arc::new(DecompressingHandler { inner: handler });
        self.inner.subscribe(subject, group, options, handler).await
    }

    async fn send_batch(&self, subject: &str, envelopes: Vec<MessageEnvelope>) -> Result<()> {
        let mut compressed = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            compressed.push(maybe_compress(&self.config, envelope)?);
        }
        self.inner.send_batch(subject, compressed).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
