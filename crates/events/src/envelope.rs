use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::EventId;

/// Envelope for a committed outbox event, containing store-assigned metadata.
///
/// Notes:
/// - `event_id` is allocated by the store and is monotonic in allocation order.
/// - `created` is the logical time supplied by the writer.
/// - `inserted` is assigned by the store and reflects commit order; it is the
///   primary component of the publisher watermark.
/// - `payload` is the typed event (usually [`crate::DomainEvent`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: EventId,
    event_name: String,

    created: DateTime<Utc>,
    inserted: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: EventId,
        event_name: impl Into<String>,
        created: DateTime<Utc>,
        inserted: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            event_name: event_name.into(),
            created,
            inserted,
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn inserted(&self) -> DateTime<Utc> {
        self.inserted
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Swap the payload while keeping the store metadata.
    pub fn map<F, T>(self, f: F) -> EventEnvelope<T>
    where
        F: FnOnce(E) -> T,
    {
        EventEnvelope {
            event_id: self.event_id,
            event_name: self.event_name,
            created: self.created,
            inserted: self.inserted,
            payload: f(self.payload),
        }
    }
}
