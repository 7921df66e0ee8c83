//! Observer chain invoked for every claimed outbox event.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use courier_events::{DomainEvent, EventBus, EventEnvelope};

#[derive(Debug, Error)]
#[error("observer `{observer}` failed: {reason}")]
pub struct ObserverError {
    pub observer: String,
    pub reason: String,
}

impl ObserverError {
    pub fn new(observer: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            observer: observer.into(),
            reason: reason.to_string(),
        }
    }
}

/// A consumer of saved events.
///
/// Observers may see the same event more than once: a failure in any
/// observer leaves the row unpublished, and the whole chain reruns on a
/// later drain.
#[async_trait]
pub trait EventObserver: Send + Sync {
    fn name(&self) -> &str;

    async fn on_event_saved(&self, event: &EventEnvelope<DomainEvent>) -> Result<(), ObserverError>;
}

#[async_trait]
impl<O> EventObserver for Arc<O>
where
    O: EventObserver + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn on_event_saved(&self, event: &EventEnvelope<DomainEvent>) -> Result<(), ObserverError> {
        (**self).on_event_saved(event).await
    }
}

/// Forwards each saved event to an in-process [`EventBus`].
pub struct BusObserver<B> {
    bus: B,
}

impl<B> BusObserver<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl<B> EventObserver for BusObserver<B>
where
    B: EventBus<EventEnvelope<DomainEvent>>,
{
    fn name(&self) -> &str {
        "bus"
    }

    async fn on_event_saved(&self, event: &EventEnvelope<DomainEvent>) -> Result<(), ObserverError> {
        self.bus
            .publish(event.clone())
            .map_err(|e| ObserverError::new(self.name(), format!("{e:?}")))
    }
}
