use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};

/// A domain event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **named** by a stable discriminator persisted next to the payload
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/discriminator (e.g. "alert.created").
    fn event_name(&self) -> &'static str;

    /// When the event occurred (logical/business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// A concrete payload shape bound to exactly one discriminator.
///
/// Implemented by every struct that can appear as an outbox payload; the
/// `NAME` constant is what gets written to the `event_name` column.
pub trait EventPayload: Serialize + DeserializeOwned + Clone + core::fmt::Debug {
    const NAME: &'static str;
}
