//! Event → notification mapping (pure, per API version).
//!
//! A mapper returns `Ok(None)` to suppress delivery, e.g. for internal-only
//! events or updates that change nothing a subscriber can see.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use courier_core::{DomainError, DomainResult, OwnerId};

use crate::catalog::{AlertClosed, AlertCreated, AlertUpdated, DomainEvent, Severity};
use crate::envelope::EventEnvelope;
use crate::notification::{ApiVersion, Notification};

/// Signature shared by every mapper.
pub type MapperFn = fn(&EventEnvelope<DomainEvent>) -> DomainResult<Option<Notification>>;

/// Mappers keyed by the API version they produce.
#[derive(Debug, Clone)]
pub struct MapperRegistry {
    mappers: Vec<(ApiVersion, MapperFn)>,
}

impl MapperRegistry {
    pub fn empty() -> Self {
        Self { mappers: Vec::new() }
    }

    /// Registry with every published API version.
    pub fn standard() -> Self {
        Self::empty().with(ApiVersion::v1(), map_v1)
    }

    pub fn with(mut self, api_version: ApiVersion, mapper: MapperFn) -> Self {
        self.mappers.retain(|(v, _)| v != &api_version);
        self.mappers.push((api_version, mapper));
        self
    }

    pub fn versions(&self) -> impl Iterator<Item = &ApiVersion> {
        self.mappers.iter().map(|(v, _)| v)
    }

    /// Run every registered mapper; suppressed versions are skipped.
    pub fn map(&self, envelope: &EventEnvelope<DomainEvent>) -> DomainResult<Vec<Notification>> {
        let mut out = Vec::new();
        for (_, mapper) in &self.mappers {
            if let Some(notification) = mapper(envelope)? {
                out.push(notification);
            }
        }
        Ok(out)
    }
}

impl Default for MapperRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AlertCreatedV1<'a> {
    id: Uuid,
    owner_id: OwnerId,
    title: &'a str,
    severity: Severity,
    created_on: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AlertUpdatedV1<'a> {
    id: Uuid,
    owner_id: OwnerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    severity: Option<Severity>,
    updated_on: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AlertClosedV1<'a> {
    id: Uuid,
    owner_id: OwnerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    closed_on: DateTime<Utc>,
}

/// Version 1 of the public contract.
pub fn map_v1(envelope: &EventEnvelope<DomainEvent>) -> DomainResult<Option<Notification>> {
    match envelope.payload() {
        DomainEvent::AlertCreated(e) => alert_created_v1(envelope, e).map(Some),
        DomainEvent::AlertUpdated(e) if e.is_noop() => Ok(None),
        DomainEvent::AlertUpdated(e) => alert_updated_v1(envelope, e).map(Some),
        DomainEvent::AlertClosed(e) => alert_closed_v1(envelope, e).map(Some),
        DomainEvent::ContactSynced(_) => Ok(None),
    }
}

fn alert_created_v1(
    envelope: &EventEnvelope<DomainEvent>,
    e: &AlertCreated,
) -> DomainResult<Notification> {
    let data = AlertCreatedV1 {
        id: e.alert_id,
        owner_id: e.owner_id,
        title: &e.title,
        severity: e.severity,
        created_on: e.occurred_at,
    };
    notification(envelope, "alert.created", &data)
}

fn alert_updated_v1(
    envelope: &EventEnvelope<DomainEvent>,
    e: &AlertUpdated,
) -> DomainResult<Notification> {
    let data = AlertUpdatedV1 {
        id: e.alert_id,
        owner_id: e.owner_id,
        title: e.title.as_deref(),
        severity: e.severity,
        updated_on: e.occurred_at,
    };
    notification(envelope, "alert.updated", &data)
}

fn alert_closed_v1(
    envelope: &EventEnvelope<DomainEvent>,
    e: &AlertClosed,
) -> DomainResult<Notification> {
    let data = AlertClosedV1 {
        id: e.alert_id,
        owner_id: e.owner_id,
        reason: e.reason.as_deref(),
        closed_on: e.occurred_at,
    };
    notification(envelope, "alert.closed", &data)
}

fn notification<T: Serialize>(
    envelope: &EventEnvelope<DomainEvent>,
    cloud_event_type: &str,
    data: &T,
) -> DomainResult<Notification> {
    let data = serde_json::to_value(data)
        .map_err(|e| DomainError::malformed(envelope.event_name(), e.to_string()))?;
    Ok(Notification::for_event(
        envelope.event_id(),
        cloud_event_type,
        ApiVersion::v1(),
        envelope.created(),
        data,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ContactSynced;
    use crate::event::Event;
    use courier_core::EventId;
    use proptest::prelude::*;

    fn envelope(id: i64, event: DomainEvent) -> EventEnvelope<DomainEvent> {
        let now = Utc::now();
        EventEnvelope::new(EventId::new(id), event.event_name(), now, now, event)
    }

    #[test]
    fn alert_created_maps_to_v1_notification() {
        let alert_id = Uuid::now_v7();
        let owner_id = OwnerId::new();
        let env = envelope(
            7,
            AlertCreated {
                alert_id,
                owner_id,
                title: "CPU hot".into(),
                severity: Severity::Critical,
                occurred_at: Utc::now(),
            }
            .into(),
        );

        let n = map_v1(&env).unwrap().unwrap();
        assert_eq!(n.cloud_event_type, "alert.created");
        assert_eq!(n.api_version, ApiVersion::v1());
        assert_eq!(n.timestamp, env.created());
        assert_eq!(n.data["id"], serde_json::json!(alert_id));
        assert_eq!(n.data["ownerId"], serde_json::json!(owner_id));
        assert_eq!(n.data["severity"], "critical");
    }

    #[test]
    fn noop_update_is_suppressed() {
        let env = envelope(
            1,
            AlertUpdated {
                alert_id: Uuid::now_v7(),
                owner_id: OwnerId::new(),
                title: None,
                severity: None,
                occurred_at: Utc::now(),
            }
            .into(),
        );
        assert!(map_v1(&env).unwrap().is_none());
    }

    #[test]
    fn partial_update_only_carries_changed_fields() {
        let env = envelope(
            2,
            AlertUpdated {
                alert_id: Uuid::now_v7(),
                owner_id: OwnerId::new(),
                title: Some("renamed".into()),
                severity: None,
                occurred_at: Utc::now(),
            }
            .into(),
        );
        let n = map_v1(&env).unwrap().unwrap();
        assert_eq!(n.data["title"], "renamed");
        assert!(n.data.get("severity").is_none());
    }

    #[test]
    fn registry_replaces_mapper_for_same_version() {
        fn never(_: &EventEnvelope<DomainEvent>) -> DomainResult<Option<Notification>> {
            Ok(None)
        }
        let registry = MapperRegistry::standard().with(ApiVersion::v1(), never);
        assert_eq!(registry.versions().count(), 1);

        let env = envelope(
            3,
            AlertClosed {
                alert_id: Uuid::now_v7(),
                owner_id: OwnerId::new(),
                reason: None,
                occurred_at: Utc::now(),
            }
            .into(),
        );
        assert!(registry.map(&env).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn contact_sync_never_leaves_the_process(id in 1i64..1_000_000, cols in proptest::collection::vec("[a-z]{1,12}", 0..5)) {
            let env = envelope(id, ContactSynced {
                contact_id: Uuid::now_v7(),
                source_key: "crm".into(),
                changed_columns: cols,
                occurred_at: Utc::now(),
            }.into());
            prop_assert!(MapperRegistry::standard().map(&env).unwrap().is_empty());
        }

        #[test]
        fn remapping_the_same_event_yields_the_same_cloud_event_id(id in 1i64..1_000_000, title in "[a-zA-Z ]{1,40}") {
            let env = envelope(id, AlertCreated {
                alert_id: Uuid::now_v7(),
                owner_id: OwnerId::new(),
                title,
                severity: Severity::Medium,
                occurred_at: Utc::now(),
            }.into());
            let first = map_v1(&env).unwrap().unwrap();
            let second = map_v1(&env).unwrap().unwrap();
            prop_assert_eq!(first.cloud_event_id, second.cloud_event_id);
            prop_assert_eq!(first.data, second.data);
        }
    }
}
