//! Transactional outbox.
//!
//! Domain code appends events in the same transaction as its state change.
//! The publisher later claims unpublished rows with skip-locked semantics,
//! runs the observer chain, and flips `published` for rows every observer
//! accepted. Delivery is at-least-once.

pub mod in_memory;
pub mod observer;
pub mod postgres;
pub mod publisher;
pub mod r#trait;

pub use in_memory::{InMemoryClaim, InMemoryOutboxStore, InMemoryTransaction};
pub use observer::{BusObserver, EventObserver, ObserverError};
pub use postgres::{PostgresClaim, PostgresOutboxStore};
pub use publisher::{DrainReport, OutboxPublisher, PublisherConfig};
pub use r#trait::{NewEvent, OutboxClaim, OutboxError, OutboxStore, StoredEvent, Watermark};
