//! The closed set of events the outbox can carry.
//!
//! Each payload struct is bound to one discriminator through [`EventPayload::NAME`],
//! and [`DomainEvent`] is the tagged union over all of them. Decoding goes through
//! [`DomainEvent::from_parts`], an exhaustive match over [`EVENT_CATALOG`]; there
//! is no reflection or registry lookup at runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use courier_core::{DomainError, DomainResult, OwnerId};

use crate::event::{Event, EventPayload};

/// Alert severity as carried in payloads and notifications.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Event: an alert was raised for an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertCreated {
    pub alert_id: Uuid,
    pub owner_id: OwnerId,
    pub title: String,
    pub severity: Severity,
    pub occurred_at: DateTime<Utc>,
}

/// Event: mutable alert fields changed.
///
/// `None` means "unchanged"; an update with every field `None` is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertUpdated {
    pub alert_id: Uuid,
    pub owner_id: OwnerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    pub occurred_at: DateTime<Utc>,
}

impl AlertUpdated {
    pub fn is_noop(&self) -> bool {
        self.title.is_none() && self.severity.is_none()
    }
}

/// Event: an alert was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertClosed {
    pub alert_id: Uuid,
    pub owner_id: OwnerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: a contact record was ingested from the system of record.
///
/// Internal bookkeeping only; never leaves the process as a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactSynced {
    pub contact_id: Uuid,
    pub source_key: String,
    pub changed_columns: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

impl EventPayload for AlertCreated {
    const NAME: &'static str = "alert.created";
}

impl EventPayload for AlertUpdated {
    const NAME: &'static str = "alert.updated";
}

impl EventPayload for AlertClosed {
    const NAME: &'static str = "alert.closed";
}

impl EventPayload for ContactSynced {
    const NAME: &'static str = "contact.synced";
}

/// Every discriminator the store may contain.
pub const EVENT_CATALOG: &[&str] = &[
    AlertCreated::NAME,
    AlertUpdated::NAME,
    AlertClosed::NAME,
    ContactSynced::NAME,
];

/// Tagged union over all outbox payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    AlertCreated(AlertCreated),
    AlertUpdated(AlertUpdated),
    AlertClosed(AlertClosed),
    ContactSynced(ContactSynced),
}

impl Event for DomainEvent {
    fn event_name(&self) -> &'static str {
        match self {
            DomainEvent::AlertCreated(_) => AlertCreated::NAME,
            DomainEvent::AlertUpdated(_) => AlertUpdated::NAME,
            DomainEvent::AlertClosed(_) => AlertClosed::NAME,
            DomainEvent::ContactSynced(_) => ContactSynced::NAME,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::AlertCreated(e) => e.occurred_at,
            DomainEvent::AlertUpdated(e) => e.occurred_at,
            DomainEvent::AlertClosed(e) => e.occurred_at,
            DomainEvent::ContactSynced(e) => e.occurred_at,
        }
    }
}

impl DomainEvent {
    /// Rebuild a typed event from its persisted discriminator and payload.
    pub fn from_parts(event_name: &str, payload: JsonValue) -> DomainResult<Self> {
        match event_name {
            AlertCreated::NAME => decode(payload).map(DomainEvent::AlertCreated),
            AlertUpdated::NAME => decode(payload).map(DomainEvent::AlertUpdated),
            AlertClosed::NAME => decode(payload).map(DomainEvent::AlertClosed),
            ContactSynced::NAME => decode(payload).map(DomainEvent::ContactSynced),
            other => Err(DomainError::unknown_event(other)),
        }
    }

    /// Serialize the variant body (the discriminator is stored separately).
    pub fn to_payload(&self) -> DomainResult<JsonValue> {
        match self {
            DomainEvent::AlertCreated(e) => encode(e),
            DomainEvent::AlertUpdated(e) => encode(e),
            DomainEvent::AlertClosed(e) => encode(e),
            DomainEvent::ContactSynced(e) => encode(e),
        }
    }
}

fn decode<P: EventPayload>(payload: JsonValue) -> DomainResult<P> {
    serde_json::from_value(payload).map_err(|e| DomainError::malformed(P::NAME, e.to_string()))
}

fn encode<P: EventPayload>(payload: &P) -> DomainResult<JsonValue> {
    serde_json::to_value(payload).map_err(|e| DomainError::malformed(P::NAME, e.to_string()))
}

macro_rules! impl_from_payload {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for DomainEvent {
                fn from(value: $variant) -> Self {
                    DomainEvent::$variant(value)
                }
            }
        )*
    };
}

impl_from_payload!(AlertCreated, AlertUpdated, AlertClosed, ContactSynced);

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<DomainEvent> {
        let now = Utc::now();
        let owner = OwnerId::new();
        vec![
            AlertCreated {
                alert_id: Uuid::now_v7(),
                owner_id: owner,
                title: "Disk almost full".into(),
                severity: Severity::High,
                occurred_at: now,
            }
            .into(),
            AlertUpdated {
                alert_id: Uuid::now_v7(),
                owner_id: owner,
                title: None,
                severity: Some(Severity::Low),
                occurred_at: now,
            }
            .into(),
            AlertClosed {
                alert_id: Uuid::now_v7(),
                owner_id: owner,
                reason: Some("resolved".into()),
                occurred_at: now,
            }
            .into(),
            ContactSynced {
                contact_id: Uuid::now_v7(),
                source_key: "crm".into(),
                changed_columns: vec!["email".into()],
                occurred_at: now,
            }
            .into(),
        ]
    }

    #[test]
    fn catalog_covers_every_variant() {
        let samples = samples();
        assert_eq!(samples.len(), EVENT_CATALOG.len());
        for event in &samples {
            assert!(EVENT_CATALOG.contains(&event.event_name()));
        }
    }

    #[test]
    fn from_parts_restores_the_same_variant() {
        for event in samples() {
            let payload = event.to_payload().unwrap();
            let decoded = DomainEvent::from_parts(event.event_name(), payload).unwrap();
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let err = DomainEvent::from_parts("alert.exploded", serde_json::json!({})).unwrap_err();
        assert_eq!(err, DomainError::unknown_event("alert.exploded"));
    }

    #[test]
    fn payload_of_wrong_shape_is_malformed() {
        let err = DomainEvent::from_parts(AlertCreated::NAME, serde_json::json!({"title": 3}))
            .unwrap_err();
        assert!(matches!(err, DomainError::MalformedPayload { ref event_name, .. } if event_name == "alert.created"));
    }
}
