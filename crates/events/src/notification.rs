//! External notification payloads (the CloudEvents "data" plus its attributes).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use courier_core::EventId;

/// Namespace for deterministic CloudEvent ids.
const CLOUD_EVENT_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0x1c, 0x2a, 0x7e, 0x39, 0x4d, 0x4b, 0x0e, 0x9a, 0x51, 0x3c, 0x88, 0x12, 0xd4, 0x70, 0x05,
]);

/// Version of the public notification contract (e.g. "v1").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiVersion(String);

impl ApiVersion {
    pub const V1: &'static str = "v1";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn v1() -> Self {
        Self::new(Self::V1)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A mapped, externally visible notification.
///
/// `data` is exactly what goes on the wire as the request body; everything
/// else travels as CloudEvents binary-mode headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub cloud_event_id: Uuid,
    pub cloud_event_type: String,
    pub api_version: ApiVersion,
    pub timestamp: DateTime<Utc>,
    pub data: JsonValue,
}

impl Notification {
    /// Build a notification whose id is derived from the outbox event.
    ///
    /// Republishing the same outbox event yields the same `cloud_event_id`,
    /// which is what makes webhook enqueueing idempotent.
    pub fn for_event(
        event_id: EventId,
        cloud_event_type: impl Into<String>,
        api_version: ApiVersion,
        timestamp: DateTime<Utc>,
        data: JsonValue,
    ) -> Self {
        let cloud_event_type = cloud_event_type.into();
        Self {
            cloud_event_id: cloud_event_id(event_id, &cloud_event_type, &api_version),
            cloud_event_type,
            api_version,
            timestamp,
            data,
        }
    }
}

/// Deterministic CloudEvent id for (event, type, api version).
pub fn cloud_event_id(event_id: EventId, cloud_event_type: &str, api_version: &ApiVersion) -> Uuid {
    let name = format!("{}:{}:{}", event_id, cloud_event_type, api_version);
    Uuid::new_v5(&CLOUD_EVENT_NAMESPACE, name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_event_id_is_stable_for_the_same_inputs() {
        let a = cloud_event_id(EventId::new(42), "alert.created", &ApiVersion::v1());
        let b = cloud_event_id(EventId::new(42), "alert.created", &ApiVersion::v1());
        assert_eq!(a, b);
    }

    #[test]
    fn cloud_event_id_differs_per_version_and_event() {
        let base = cloud_event_id(EventId::new(42), "alert.created", &ApiVersion::v1());
        assert_ne!(base, cloud_event_id(EventId::new(43), "alert.created", &ApiVersion::v1()));
        assert_ne!(base, cloud_event_id(EventId::new(42), "alert.created", &ApiVersion::new("v2")));
    }
}
