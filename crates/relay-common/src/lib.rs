//! Shared types for the Relay messaging core.
//!
//! This crate carries everything the other crates agree on:
//! - `MessageEnvelope`: the wire-form record for one message
//! - `DispatchError`: the failure taxonomy surfaced from every dispatch
//! - `Serializer` contract plus the JSON and BSON implementations
//! - Outbox/Inbox/Idempotency/dead-letter records and their store contracts
//! - Structured logging initialization

pub mod envelope;
pub mod error;
pub mod logging;
pub mod records;
pub mod serializer;
pub mod stores;

pub use envelope::{EnvelopeBuilder, MessageEnvelope};
pub use error::{DispatchError, ErrorKind};
pub use records::{
    DeadLetterRecord, IdempotencyRecord, InboxRecord, OutboxRecord, OutboxStatus,
};
pub use serializer::{
    BsonSerializer, CodecError, JsonSerializer, Serializer, SerializerRegistry,
    CONTENT_TYPE_BSON, CONTENT_TYPE_JSON,
};
pub use stores::{
    DeadLetterStore, EnvelopeDispatcher, IdempotencyStore, InboxStore, OutboxStore, StoreError,
};

/// Last path segment of a type name, used as the default logical message type.
///
/// `my_app::orders::OrderPlaced` becomes `OrderPlaced`.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inner;

    #[test]
    fn short_type_name_strips_path() {
        assert_eq!(short_type_name::<Inner>(), "Inner");
        assert_eq!(short_type_name::<u32>(), "u32");
    }
}
