//! Notification → per-endpoint webhook messages.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};

use courier_events::{DomainEvent, EventEnvelope, MapperRegistry, Notification};

use super::store::{WebhookStore, WebhookStoreError};
use super::types::WebhookMessage;
use crate::outbox::{EventObserver, ObserverError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub matched: usize,
    pub enqueued: usize,
    /// Already enqueued by an earlier publish of the same event.
    pub duplicates: usize,
}

impl DispatchOutcome {
    fn absorb(&mut self, other: DispatchOutcome) {
        self.matched += other.matched;
        self.enqueued += other.enqueued;
        self.duplicates += other.duplicates;
    }
}

pub struct WebhookDispatcher<W> {
    store: W,
}

impl<W: WebhookStore> WebhookDispatcher<W> {
    pub fn new(store: W) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &W {
        &self.store
    }

    /// Enqueue one message per enabled endpoint subscribed to the
    /// notification's type on its API version.
    #[instrument(
        skip(self, notification),
        fields(cloud_event_id = %notification.cloud_event_id, cloud_event_type = %notification.cloud_event_type),
        err
    )]
    pub async fn dispatch(&self, notification: &Notification) -> Result<DispatchOutcome, WebhookStoreError> {
        let endpoints = self
            .store
            .subscribed_endpoints(&notification.cloud_event_type, &notification.api_version)
            .await?;

        let now = Utc::now();
        let mut outcome = DispatchOutcome::default();
        for endpoint in endpoints
            .iter()
            .filter(|e| e.accepts(&notification.cloud_event_type, &notification.api_version))
        {
            outcome.matched += 1;
            let message = WebhookMessage::for_endpoint(endpoint, notification, now);
            if self.store.enqueue(&message).await? {
                outcome.enqueued += 1;
            } else {
                outcome.duplicates += 1;
                debug!(endpoint_id = %endpoint.endpoint_id, "webhook message already enqueued");
            }
        }
        Ok(outcome)
    }
}

/// Outbox observer that maps each event and dispatches the notifications.
pub struct WebhookObserver<W> {
    mappers: MapperRegistry,
    dispatcher: WebhookDispatcher<W>,
}

impl<W: WebhookStore> WebhookObserver<W> {
    pub fn new(mappers: MapperRegistry, store: W) -> Self {
        Self {
            mappers,
            dispatcher: WebhookDispatcher::new(store),
        }
    }

    pub fn dispatcher(&self) -> &WebhookDispatcher<W> {
        &self.dispatcher
    }

    pub async fn handle(&self, event: &EventEnvelope<DomainEvent>) -> Result<DispatchOutcome, ObserverError> {
        let notifications = self
            .mappers
            .map(event)
            .map_err(|e| ObserverError::new("webhooks", e))?;

        let mut total = DispatchOutcome::default();
        for notification in &notifications {
            let outcome = self
                .dispatcher
                .dispatch(notification)
                .await
                .map_err(|e| ObserverError::new("webhooks", e))?;
            total.absorb(outcome);
        }
        Ok(total)
    }
}

#[async_trait]
impl<W: WebhookStore> EventObserver for WebhookObserver<W> {
    fn name(&self) -> &str {
        "webhooks"
    }

    async fn on_event_saved(&self, event: &EventEnvelope<DomainEvent>) -> Result<(), ObserverError> {
        self.handle(event).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::{InMemoryWebhookStore, WebhookEndpoint};
    use courier_core::{EventId, OwnerId};
    use courier_events::{AlertCreated, AlertUpdated, ApiVersion, Event, Severity};
    use uuid::Uuid;

    fn envelope(event: DomainEvent) -> EventEnvelope<DomainEvent> {
        let now = Utc::now();
        EventEnvelope::new(EventId::new(11), event.event_name(), now, now, event)
    }

    fn created() -> DomainEvent {
        AlertCreated {
            alert_id: Uuid::now_v7(),
            owner_id: OwnerId::new(),
            title: "disk full".into(),
            severity: Severity::High,
            occurred_at: Utc::now(),
        }
        .into()
    }

    #[tokio::test]
    async fn only_matching_endpoints_receive_messages() {
        let store = InMemoryWebhookStore::new();
        let subscribed = WebhookEndpoint::new(OwnerId::new(), "https://a.test", ApiVersion::v1(), ["alert.created"]);
        let other_type = WebhookEndpoint::new(OwnerId::new(), "https://b.test", ApiVersion::v1(), ["alert.closed"]);
        let other_version =
            WebhookEndpoint::new(OwnerId::new(), "https://c.test", ApiVersion::new("v2"), ["alert.created"]);
        let disabled =
            WebhookEndpoint::new(OwnerId::new(), "https://d.test", ApiVersion::v1(), ["alert.created"]).disabled();
        for e in [&subscribed, &other_type, &other_version, &disabled] {
            store.add_endpoint(e.clone());
        }

        let observer = WebhookObserver::new(MapperRegistry::standard(), store.clone());
        let outcome = observer.handle(&envelope(created())).await.unwrap();

        assert_eq!(outcome.enqueued, 1);
        assert_eq!(store.messages_for(subscribed.endpoint_id).len(), 1);
        for e in [&other_type, &other_version, &disabled] {
            assert!(store.messages_for(e.endpoint_id).is_empty());
        }
    }

    #[tokio::test]
    async fn republishing_an_event_is_absorbed() {
        let store = InMemoryWebhookStore::new();
        store.add_endpoint(WebhookEndpoint::new(OwnerId::new(), "https://a.test", ApiVersion::v1(), ["alert.created"]));
        let observer = WebhookObserver::new(MapperRegistry::standard(), store.clone());
        let env = envelope(created());

        observer.on_event_saved(&env).await.unwrap();
        let second = observer.handle(&env).await.unwrap();

        assert_eq!(second.duplicates, 1);
        assert_eq!(store.messages().len(), 1);
    }

    #[tokio::test]
    async fn suppressed_events_enqueue_nothing() {
        let store = InMemoryWebhookStore::new();
        store.add_endpoint(WebhookEndpoint::new(OwnerId::new(), "https://a.test", ApiVersion::v1(), ["alert.updated"]));
        let observer = WebhookObserver::new(MapperRegistry::standard(), store.clone());

        let noop: DomainEvent = AlertUpdated {
            alert_id: Uuid::now_v7(),
            owner_id: OwnerId::new(),
            title: None,
            severity: None,
            occurred_at: Utc::now(),
        }
        .into();
        let outcome = observer.handle(&envelope(noop)).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::default());
        assert!(store.messages().is_empty());
    }
}
