use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use courier_core::{DomainError, EventId};
use courier_events::{DomainEvent, Event, EventEnvelope};

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox storage error: {0}")]
    Storage(String),

    #[error("failed to encode event: {0}")]
    Encode(#[from] DomainError),

    #[error("outbox state poisoned")]
    Poisoned,
}

/// An event to append; the store assigns id and insertion time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_name: String,
    pub payload: JsonValue,
    pub created: DateTime<Utc>,
}

impl NewEvent {
    /// Encode a typed event under its discriminator.
    pub fn from_domain(event: &DomainEvent) -> Result<Self, OutboxError> {
        Ok(Self {
            event_name: event.event_name().to_string(),
            payload: event.to_payload()?,
            created: event.occurred_at(),
        })
    }
}

impl TryFrom<DomainEvent> for NewEvent {
    type Error = OutboxError;

    fn try_from(event: DomainEvent) -> Result<Self, Self::Error> {
        Self::from_domain(&event)
    }
}

/// A committed outbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub event_name: String,
    pub payload: JsonValue,
    pub created: DateTime<Utc>,
    pub inserted: DateTime<Utc>,
    pub published: bool,
}

impl StoredEvent {
    pub fn watermark(&self) -> Watermark {
        Watermark::at(self.inserted, self.created, self.event_id)
    }

    /// Resolve the discriminator and deserialize the payload.
    pub fn decode(&self) -> Result<EventEnvelope<DomainEvent>, DomainError> {
        let event = DomainEvent::from_parts(&self.event_name, self.payload.clone())?;
        Ok(EventEnvelope::new(
            self.event_id,
            self.event_name.clone(),
            self.created,
            self.inserted,
            event,
        ))
    }
}

/// Claim position within one drain: `(inserted, created, event_id)`.
///
/// Insertion time leads so that ids allocated early but committed late are
/// not skipped; the id only breaks ties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(Option<(DateTime<Utc>, DateTime<Utc>, EventId)>);

impl Watermark {
    /// Before every row.
    pub fn start() -> Self {
        Self(None)
    }

    pub fn at(inserted: DateTime<Utc>, created: DateTime<Utc>, event_id: EventId) -> Self {
        Self(Some((inserted, created, event_id)))
    }

    pub fn position(&self) -> Option<(DateTime<Utc>, DateTime<Utc>, EventId)> {
        self.0
    }

    pub fn precedes(&self, event: &StoredEvent) -> bool {
        *self < event.watermark()
    }
}

/// Rows claimed by one publisher; locks are held until commit or drop.
#[async_trait]
pub trait OutboxClaim: Send {
    /// Claimed rows in watermark order.
    fn events(&self) -> &[StoredEvent];

    fn mark_published(&mut self, event_id: EventId);

    /// Persist `published` for marked rows and release the locks.
    /// Returns the number of rows flipped.
    async fn commit(self) -> Result<u64, OutboxError>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    type Claim: OutboxClaim;

    /// Lock up to `limit` unpublished rows after `after`, skipping rows
    /// another claim holds.
    async fn claim(&self, after: &Watermark, limit: usize) -> Result<Self::Claim, OutboxError>;

    async fn unpublished_count(&self) -> Result<u64, OutboxError>;

    /// Insertion time of the oldest unpublished row.
    async fn oldest_unpublished(&self) -> Result<Option<DateTime<Utc>>, OutboxError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    type Claim = S::Claim;

    async fn claim(&self, after: &Watermark, limit: usize) -> Result<Self::Claim, OutboxError> {
        (**self).claim(after, limit).await
    }

    async fn unpublished_count(&self) -> Result<u64, OutboxError> {
        (**self).unpublished_count().await
    }

    async fn oldest_unpublished(&self) -> Result<Option<DateTime<Utc>>, OutboxError> {
        (**self).oldest_unpublished().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn stored(id: i64, inserted: DateTime<Utc>) -> StoredEvent {
        StoredEvent {
            event_id: EventId::new(id),
            event_name: "alert.closed".into(),
            payload: serde_json::json!({}),
            created: inserted,
            inserted,
            published: false,
        }
    }

    #[test]
    fn watermark_orders_by_insertion_before_id() {
        let t0 = Utc::now();
        let late_commit = stored(1, t0 + Duration::milliseconds(5));
        let early_commit = stored(2, t0);

        assert!(early_commit.watermark() < late_commit.watermark());
        assert!(early_commit.watermark().precedes(&late_commit));
        assert!(Watermark::start().precedes(&early_commit));
        assert!(!late_commit.watermark().precedes(&late_commit));
    }
}
