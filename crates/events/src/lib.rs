//! `courier-events`: pure event mechanics.
//!
//! - [`DomainEvent`]: tagged union over every payload the outbox can carry
//! - [`EventEnvelope`]: a committed event plus store-assigned metadata
//! - [`Notification`] and [`MapperRegistry`]: event → external notification
//! - [`EventBus`]: in-process fan-out for alternate consumers
//!
//! No IO and no async; storage and delivery live in `courier-infra`.

pub mod bus;
pub mod catalog;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod mapper;
pub mod notification;

pub use bus::{EventBus, Subscription};
pub use catalog::{
    AlertClosed, AlertCreated, AlertUpdated, ContactSynced, DomainEvent, EVENT_CATALOG, Severity,
};
pub use envelope::EventEnvelope;
pub use event::{Event, EventPayload};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use mapper::{MapperFn, MapperRegistry, map_v1};
pub use notification::{ApiVersion, Notification, cloud_event_id};
