//! Webhook endpoint and message persistence.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use courier_core::{EndpointId, MessageId};
use courier_events::ApiVersion;

use super::types::{MessageStatus, WebhookEndpoint, WebhookMessage};

#[derive(Debug, Error)]
pub enum WebhookStoreError {
    #[error("webhook message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("message {message_id} is {status:?}, expected {expected:?}")]
    InvalidState {
        message_id: MessageId,
        status: MessageStatus,
        expected: MessageStatus,
    },

    #[error("webhook storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait WebhookStore: Send + Sync {
    /// Enabled endpoints on `api_version` subscribed to `cloud_event_type`.
    async fn subscribed_endpoints(
        &self,
        cloud_event_type: &str,
        api_version: &ApiVersion,
    ) -> Result<Vec<WebhookEndpoint>, WebhookStoreError>;

    async fn endpoint(&self, endpoint_id: EndpointId) -> Result<Option<WebhookEndpoint>, WebhookStoreError>;

    /// Insert a pending message. Returns `false` if the endpoint already has
    /// a message for the same CloudEvent id.
    async fn enqueue(&self, message: &WebhookMessage) -> Result<bool, WebhookStoreError>;

    /// Take up to `limit` due pending messages and push their next attempt
    /// `lease` into the future so no other scheduler picks them up meanwhile.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<WebhookMessage>, WebhookStoreError>;

    /// Restart the lease on a claimed message, unless another scheduler has
    /// claimed it since. `claimed_until` is the `next_delivery_attempt` the
    /// claim returned. Returns `false` if the claim was lost.
    async fn renew_lease(
        &self,
        message_id: MessageId,
        claimed_until: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, WebhookStoreError>;

    async fn mark_delivered(&self, message_id: MessageId, at: DateTime<Utc>) -> Result<(), WebhookStoreError>;

    async fn reschedule(
        &self,
        message_id: MessageId,
        attempts: u32,
        next_attempt: DateTime<Utc>,
        error: &str,
    ) -> Result<(), WebhookStoreError>;

    async fn mark_dead(&self, message_id: MessageId, attempts: u32, error: &str) -> Result<(), WebhookStoreError>;

    /// Return a dead message to `pending` with zero attempts, due at `now`.
    async fn requeue_dead(&self, message_id: MessageId, now: DateTime<Utc>) -> Result<(), WebhookStoreError>;

    async fn message(&self, message_id: MessageId) -> Result<Option<WebhookMessage>, WebhookStoreError>;
}

#[async_trait]
impl<W> WebhookStore for Arc<W>
where
    W: WebhookStore + ?Sized,
{
    async fn subscribed_endpoints(
        &self,
        cloud_event_type: &str,
        api_version: &ApiVersion,
    ) -> Result<Vec<WebhookEndpoint>, WebhookStoreError> {
        (**self).subscribed_endpoints(cloud_event_type, api_version).await
    }

    async fn endpoint(&self, endpoint_id: EndpointId) -> Result<Option<WebhookEndpoint>, WebhookStoreError> {
        (**self).endpoint(endpoint_id).await
    }

    async fn enqueue(&self, message: &WebhookMessage) -> Result<bool, WebhookStoreError> {
        (**self).enqueue(message).await
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<WebhookMessage>, WebhookStoreError> {
        (**self).claim_due(now, limit, lease).await
    }

    async fn renew_lease(
        &self,
        message_id: MessageId,
        claimed_until: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, WebhookStoreError> {
        (**self).renew_lease(message_id, claimed_until, until).await
    }

    async fn mark_delivered(&self, message_id: MessageId, at: DateTime<Utc>) -> Result<(), WebhookStoreError> {
        (**self).mark_delivered(message_id, at).await
    }

    async fn reschedule(
        &self,
        message_id: MessageId,
        attempts: u32,
        next_attempt: DateTime<Utc>,
        error: &str,
    ) -> Result<(), WebhookStoreError> {
        (**self).reschedule(message_id, attempts, next_attempt, error).await
    }

    async fn mark_dead(&self, message_id: MessageId, attempts: u32, error: &str) -> Result<(), WebhookStoreError> {
        (**self).mark_dead(message_id, attempts, error).await
    }

    async fn requeue_dead(&self, message_id: MessageId, now: DateTime<Utc>) -> Result<(), WebhookStoreError> {
        (**self).requeue_dead(message_id, now).await
    }

    async fn message(&self, message_id: MessageId) -> Result<Option<WebhookMessage>, WebhookStoreError> {
        (**self).message(message_id).await
    }
}

#[derive(Debug, Default)]
struct Inner {
    endpoints: HashMap<EndpointId, WebhookEndpoint>,
    messages: HashMap<MessageId, WebhookMessage>,
    enqueued_keys: HashSet<(EndpointId, Uuid)>,
}

impl Inner {
    fn pending_mut(&mut self, message_id: MessageId) -> Result<&mut WebhookMessage, WebhookStoreError> {
        Self::in_state(&mut self.messages, message_id, MessageStatus::Pending)
    }

    fn in_state(
        messages: &mut HashMap<MessageId, WebhookMessage>,
        message_id: MessageId,
        expected: MessageStatus,
    ) -> Result<&mut WebhookMessage, WebhookStoreError> {
        let message = messages
            .get_mut(&message_id)
            .ok_or(WebhookStoreError::MessageNotFound(message_id))?;
        if message.status != expected {
            return Err(WebhookStoreError::InvalidState {
                message_id,
                status: message.status,
                expected,
            });
        }
        Ok(message)
    }
}

/// In-memory webhook store for tests/dev.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWebhookStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryWebhookStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_endpoint(&self, endpoint: WebhookEndpoint) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.endpoints.insert(endpoint.endpoint_id, endpoint);
        }
    }

    pub fn messages(&self) -> Vec<WebhookMessage> {
        self.inner
            .lock()
            .map(|i| i.messages.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn messages_for(&self, endpoint_id: EndpointId) -> Vec<WebhookMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.endpoint_id == endpoint_id)
            .collect()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, WebhookStoreError> {
        self.inner
            .lock()
            .map_err(|_| WebhookStoreError::Storage("webhook store lock poisoned".into()))
    }
}

#[async_trait]
impl WebhookStore for InMemoryWebhookStore {
    async fn subscribed_endpoints(
        &self,
        cloud_event_type: &str,
        api_version: &ApiVersion,
    ) -> Result<Vec<WebhookEndpoint>, WebhookStoreError> {
        let inner = self.lock()?;
        Ok(inner
            .endpoints
            .values()
            .filter(|e| e.accepts(cloud_event_type, api_version))
            .cloned()
            .collect())
    }

    async fn endpoint(&self, endpoint_id: EndpointId) -> Result<Option<WebhookEndpoint>, WebhookStoreError> {
        Ok(self.lock()?.endpoints.get(&endpoint_id).cloned())
    }

    async fn enqueue(&self, message: &WebhookMessage) -> Result<bool, WebhookStoreError> {
        let mut inner = self.lock()?;
        if !inner.enqueued_keys.insert((message.endpoint_id, message.cloud_event_id)) {
            return Ok(false);
        }
        inner.messages.insert(message.message_id, message.clone());
        Ok(true)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<WebhookMessage>, WebhookStoreError> {
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut inner = self.lock()?;

        let mut due: Vec<&mut WebhookMessage> = inner.messages.values_mut().filter(|m| m.is_due(now)).collect();
        due.sort_by_key(|m| m.next_delivery_attempt);
        due.truncate(limit);

        Ok(due
            .into_iter()
            .map(|m| {
                m.next_delivery_attempt = now + lease;
                m.clone()
            })
            .collect())
    }

    async fn renew_lease(
        &self,
        message_id: MessageId,
        claimed_until: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, WebhookStoreError> {
        let mut inner = self.lock()?;
        match inner.messages.get_mut(&message_id) {
            Some(m) if m.status == MessageStatus::Pending && m.next_delivery_attempt == claimed_until => {
                m.next_delivery_attempt = until;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_delivered(&self, message_id: MessageId, at: DateTime<Utc>) -> Result<(), WebhookStoreError> {
        let mut inner = self.lock()?;
        let message = inner.pending_mut(message_id)?;
        message.status = MessageStatus::Delivered;
        message.delivered_at = Some(at);
        Ok(())
    }

    async fn reschedule(
        &self,
        message_id: MessageId,
        attempts: u32,
        next_attempt: DateTime<Utc>,
        error: &str,
    ) -> Result<(), WebhookStoreError> {
        let mut inner = self.lock()?;
        let message = inner.pending_mut(message_id)?;
        message.attempts = attempts;
        message.next_delivery_attempt = next_attempt;
        message.last_error = Some(error.to_string());
        Ok(())
    }

    async fn mark_dead(&self, message_id: MessageId, attempts: u32, error: &str) -> Result<(), WebhookStoreError> {
        let mut inner = self.lock()?;
        let message = inner.pending_mut(message_id)?;
        message.status = MessageStatus::Dead;
        message.attempts = attempts;
        message.last_error = Some(error.to_string());
        Ok(())
    }

    async fn requeue_dead(&self, message_id: MessageId, now: DateTime<Utc>) -> Result<(), WebhookStoreError> {
        let mut inner = self.lock()?;
        let message = Inner::in_state(&mut inner.messages, message_id, MessageStatus::Dead)?;
        message.status = MessageStatus::Pending;
        message.attempts = 0;
        message.next_delivery_attempt = now;
        Ok(())
    }

    async fn message(&self, message_id: MessageId) -> Result<Option<WebhookMessage>, WebhookStoreError> {
        Ok(self.lock()?.messages.get(&message_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{EventId, OwnerId};
    use courier_events::Notification;

    fn fixture() -> (InMemoryWebhookStore, WebhookEndpoint, Notification) {
        let store = InMemoryWebhookStore::new();
        let endpoint = WebhookEndpoint::new(OwnerId::new(), "https://hooks.test", ApiVersion::v1(), ["alert.created"]);
        store.add_endpoint(endpoint.clone());
        let n = Notification::for_event(EventId::new(1), "alert.created", ApiVersion::v1(), Utc::now(), serde_json::json!({}));
        (store, endpoint, n)
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_endpoint_and_cloud_event() {
        let (store, endpoint, n) = fixture();
        let now = Utc::now();

        assert!(store.enqueue(&WebhookMessage::for_endpoint(&endpoint, &n, now)).await.unwrap());
        assert!(!store.enqueue(&WebhookMessage::for_endpoint(&endpoint, &n, now)).await.unwrap());
        assert_eq!(store.messages().len(), 1);
    }

    #[tokio::test]
    async fn claimed_messages_are_hidden_until_the_lease_expires() {
        let (store, endpoint, n) = fixture();
        let now = Utc::now();
        store.enqueue(&WebhookMessage::for_endpoint(&endpoint, &n, now)).await.unwrap();

        let lease = Duration::from_secs(60);
        assert_eq!(store.claim_due(now, 10, lease).await.unwrap().len(), 1);
        assert!(store.claim_due(now, 10, lease).await.unwrap().is_empty());
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(store.claim_due(later, 10, lease).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn renewal_fails_once_another_claim_took_over() {
        let (store, endpoint, n) = fixture();
        let now = Utc::now();
        store.enqueue(&WebhookMessage::for_endpoint(&endpoint, &n, now)).await.unwrap();
        let lease = Duration::from_secs(60);

        let first = store.claim_due(now, 10, lease).await.unwrap().remove(0);
        let later = now + chrono::Duration::seconds(61);
        let second = store.claim_due(later, 10, lease).await.unwrap().remove(0);

        let until = later + chrono::Duration::seconds(120);
        assert!(!store.renew_lease(first.message_id, first.next_delivery_attempt, until).await.unwrap());
        assert!(store.renew_lease(second.message_id, second.next_delivery_attempt, until).await.unwrap());
        assert_eq!(store.message(first.message_id).await.unwrap().unwrap().next_delivery_attempt, until);
    }

    #[tokio::test]
    async fn dead_messages_can_be_requeued() {
        let (store, endpoint, n) = fixture();
        let now = Utc::now();
        let msg = WebhookMessage::for_endpoint(&endpoint, &n, now);
        store.enqueue(&msg).await.unwrap();

        assert!(matches!(
            store.requeue_dead(msg.message_id, now).await,
            Err(WebhookStoreError::InvalidState { .. })
        ));

        store.mark_dead(msg.message_id, 8, "HTTP 500").await.unwrap();
        store.requeue_dead(msg.message_id, now).await.unwrap();

        let requeued = store.message(msg.message_id).await.unwrap().unwrap();
        assert_eq!(requeued.status, MessageStatus::Pending);
        assert_eq!(requeued.attempts, 0);
        assert_eq!(requeued.last_error.as_deref(), Some("HTTP 500"));
    }

    #[tokio::test]
    async fn delivered_messages_reject_further_transitions() {
        let (store, endpoint, n) = fixture();
        let msg = WebhookMessage::for_endpoint(&endpoint, &n, Utc::now());
        store.enqueue(&msg).await.unwrap();
        store.mark_delivered(msg.message_id, Utc::now()).await.unwrap();

        assert!(store.mark_dead(msg.message_id, 1, "late").await.is_err());
        assert!(matches!(
            store.mark_delivered(MessageId::new(), Utc::now()).await,
            Err(WebhookStoreError::MessageNotFound(_))
        ));
    }
}
