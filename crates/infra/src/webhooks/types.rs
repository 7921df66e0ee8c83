use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use courier_core::{DomainError, EndpointId, MessageId, OwnerId};
use courier_events::{ApiVersion, Notification};

/// A subscriber registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub endpoint_id: EndpointId,
    pub owner_id: OwnerId,
    pub address: String,
    pub api_version: ApiVersion,
    pub cloud_event_types: BTreeSet<String>,
    pub enabled: bool,
}

impl WebhookEndpoint {
    pub fn new<I, T>(owner_id: OwnerId, address: impl Into<String>, api_version: ApiVersion, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            endpoint_id: EndpointId::new(),
            owner_id,
            address: address.into(),
            api_version,
            cloud_event_types: types.into_iter().map(Into::into).collect(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Enabled, same contract version, and subscribed to the type.
    pub fn accepts(&self, cloud_event_type: &str, api_version: &ApiVersion) -> bool {
        self.enabled && &self.api_version == api_version && self.cloud_event_types.contains(cloud_event_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
    /// Attempts exhausted; kept for inspection and manual requeue.
    Dead,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Delivered | MessageStatus::Dead)
    }
}

impl FromStr for MessageStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "delivered" => Ok(MessageStatus::Delivered),
            "dead" => Ok(MessageStatus::Dead),
            other => Err(DomainError::validation(format!("unknown message status `{other}`"))),
        }
    }
}

/// One notification bound for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookMessage {
    pub message_id: MessageId,
    pub endpoint_id: EndpointId,
    pub cloud_event_id: Uuid,
    pub cloud_event_type: String,
    pub timestamp: DateTime<Utc>,
    pub api_version: ApiVersion,
    pub data: JsonValue,
    pub next_delivery_attempt: DateTime<Utc>,
    /// Failed deliveries so far.
    pub attempts: u32,
    pub status: MessageStatus,
    pub last_error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl WebhookMessage {
    /// A pending message, due immediately.
    pub fn for_endpoint(endpoint: &WebhookEndpoint, notification: &Notification, now: DateTime<Utc>) -> Self {
        Self {
            message_id: MessageId::new(),
            endpoint_id: endpoint.endpoint_id,
            cloud_event_id: notification.cloud_event_id,
            cloud_event_type: notification.cloud_event_type.clone(),
            timestamp: notification.timestamp,
            api_version: notification.api_version.clone(),
            data: notification.data.clone(),
            next_delivery_attempt: now,
            attempts: 0,
            status: MessageStatus::Pending,
            last_error: None,
            delivered_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Pending && self.next_delivery_attempt <= now
    }

    /// Stable per-message value used to spread retry jitter.
    pub fn jitter_salt(&self) -> u64 {
        self.message_id.as_uuid().as_u64_pair().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::EventId;

    #[test]
    fn endpoint_filters_on_type_version_and_enabled() {
        let endpoint = WebhookEndpoint::new(OwnerId::new(), "https://hooks.test/a", ApiVersion::v1(), ["alert.created"]);

        assert!(endpoint.accepts("alert.created", &ApiVersion::v1()));
        assert!(!endpoint.accepts("alert.closed", &ApiVersion::v1()));
        assert!(!endpoint.accepts("alert.created", &ApiVersion::new("v2")));
        assert!(!endpoint.clone().disabled().accepts("alert.created", &ApiVersion::v1()));
    }

    #[test]
    fn message_copies_notification_attributes() {
        let endpoint = WebhookEndpoint::new(OwnerId::new(), "https://hooks.test/a", ApiVersion::v1(), ["alert.created"]);
        let now = Utc::now();
        let n = Notification::for_event(EventId::new(9), "alert.created", ApiVersion::v1(), now, serde_json::json!({"id": 1}));

        let msg = WebhookMessage::for_endpoint(&endpoint, &n, now);
        assert_eq!(msg.cloud_event_id, n.cloud_event_id);
        assert_eq!(msg.endpoint_id, endpoint.endpoint_id);
        assert_eq!(msg.data, n.data);
        assert!(msg.is_due(now));
        assert_eq!("dead".parse::<MessageStatus>().unwrap(), MessageStatus::Dead);
    }
}
