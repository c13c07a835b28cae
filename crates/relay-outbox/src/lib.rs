//! Reliability layer: transactional outbox, inbox dedup, idempotency.
//!
//! - `OutboxSender` stages outgoing messages as `Pending` records
//! - `OutboxPublisher` drains them through a transport with leases,
//!   exponential backoff, and dead-letter capture
//! - `InboxConsumer` plugs into a transport subscription and enforces
//!   at-most-once processing per message id
//! - `memory` holds the in-process store implementations; durable stores
//!   implement the contracts in `relay-common`

pub mod consumer;
pub mod memory;
pub mod publisher;
pub mod purge;
pub mod sender;

pub use consumer::InboxConsumer;
pub use memory::{
    InMemoryDeadLetterStore, InMemoryIdempotencyStore, InMemoryInboxStore, InMemoryOutboxStore,
};
pub use publisher::OutboxPublisher;
pub use purge::IdempotencyPurger;
pub use sender::OutboxSender;
