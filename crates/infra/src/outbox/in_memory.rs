use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use courier_core::EventId;

use super::r#trait::{NewEvent, OutboxClaim, OutboxError, OutboxStore, StoredEvent, Watermark};

#[derive(Debug, Default)]
struct State {
    /// Committed rows only.
    rows: Vec<StoredEvent>,
    /// Rows held by an open claim.
    locked: HashSet<EventId>,
    next_id: i64,
    last_inserted: Option<DateTime<Utc>>,
}

impl State {
    fn allocate_id(&mut self) -> EventId {
        self.next_id += 1;
        EventId::new(self.next_id)
    }

    /// Strictly increasing commit clock.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let inserted = match self.last_inserted {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_inserted = Some(inserted);
        inserted
    }
}

/// In-memory outbox with the same visibility and claim semantics as the
/// Postgres store.
///
/// Ids are allocated at append time, insertion time at commit time, so an
/// early id can become visible after a later one.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a write transaction; appended events stay invisible until commit.
    pub fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            state: self.state.clone(),
            pending: Vec::new(),
        }
    }

    /// Append and commit in one step.
    pub fn append(&self, events: Vec<NewEvent>) -> Result<Vec<EventId>, OutboxError> {
        let mut tx = self.begin();
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            ids.push(tx.append(event)?);
        }
        tx.commit()?;
        Ok(ids)
    }

    pub fn get(&self, event_id: EventId) -> Option<StoredEvent> {
        let state = self.state.lock().ok()?;
        state.rows.iter().find(|r| r.event_id == event_id).cloned()
    }

    pub fn all(&self) -> Vec<StoredEvent> {
        self.state.lock().map(|s| s.rows.clone()).unwrap_or_default()
    }
}

/// Uncommitted outbox writes.
#[derive(Debug)]
pub struct InMemoryTransaction {
    state: Arc<Mutex<State>>,
    pending: Vec<(EventId, NewEvent)>,
}

impl InMemoryTransaction {
    /// Stage an event. The id comes from the shared sequence immediately.
    pub fn append(&mut self, event: NewEvent) -> Result<EventId, OutboxError> {
        let mut state = self.state.lock().map_err(|_| OutboxError::Poisoned)?;
        let id = state.allocate_id();
        self.pending.push((id, event));
        Ok(id)
    }

    pub fn commit(mut self) -> Result<Vec<StoredEvent>, OutboxError> {
        let mut state = self.state.lock().map_err(|_| OutboxError::Poisoned)?;
        let inserted = state.tick();

        let committed: Vec<StoredEvent> = self
            .pending
            .drain(..)
            .map(|(event_id, e)| StoredEvent {
                event_id,
                event_name: e.event_name,
                payload: e.payload,
                created: e.created,
                inserted,
                published: false,
            })
            .collect();
        state.rows.extend(committed.iter().cloned());
        Ok(committed)
    }

    /// Discard staged events (same as dropping).
    pub fn rollback(self) {}
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    type Claim = InMemoryClaim;

    async fn claim(&self, after: &Watermark, limit: usize) -> Result<InMemoryClaim, OutboxError> {
        let mut state = self.state.lock().map_err(|_| OutboxError::Poisoned)?;

        let mut candidates: Vec<StoredEvent> = state
            .rows
            .iter()
            .filter(|r| !r.published && !state.locked.contains(&r.event_id) && after.precedes(r))
            .cloned()
            .collect();
        candidates.sort_by_key(StoredEvent::watermark);
        candidates.truncate(limit);

        for e in &candidates {
            state.locked.insert(e.event_id);
        }

        Ok(InMemoryClaim {
            state: self.state.clone(),
            events: candidates,
            published: Vec::new(),
        })
    }

    async fn unpublished_count(&self) -> Result<u64, OutboxError> {
        let state = self.state.lock().map_err(|_| OutboxError::Poisoned)?;
        Ok(state.rows.iter().filter(|r| !r.published).count() as u64)
    }

    async fn oldest_unpublished(&self) -> Result<Option<DateTime<Utc>>, OutboxError> {
        let state = self.state.lock().map_err(|_| OutboxError::Poisoned)?;
        Ok(state.rows.iter().filter(|r| !r.published).map(|r| r.inserted).min())
    }
}

#[derive(Debug)]
pub struct InMemoryClaim {
    state: Arc<Mutex<State>>,
    events: Vec<StoredEvent>,
    published: Vec<EventId>,
}

#[async_trait]
impl OutboxClaim for InMemoryClaim {
    fn events(&self) -> &[StoredEvent] {
        &self.events
    }

    fn mark_published(&mut self, event_id: EventId) {
        if self.events.iter().any(|e| e.event_id == event_id) {
            self.published.push(event_id);
        }
    }

    async fn commit(mut self) -> Result<u64, OutboxError> {
        let marked = std::mem::take(&mut self.published);
        let mut state = self.state.lock().map_err(|_| OutboxError::Poisoned)?;
        let mut flipped = 0;
        for row in state.rows.iter_mut() {
            if marked.contains(&row.event_id) && !row.published {
                row.published = true;
                flipped += 1;
            }
        }
        Ok(flipped)
    }
}

impl Drop for InMemoryClaim {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            for e in &self.events {
                state.locked.remove(&e.event_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_event(name: &str) -> NewEvent {
        NewEvent {
            event_name: name.into(),
            payload: json!({}),
            created: Utc::now(),
        }
    }

    #[tokio::test]
    async fn uncommitted_events_are_invisible() {
        let store = InMemoryOutboxStore::new();
        let mut tx = store.begin();
        tx.append(new_event("alert.closed")).unwrap();

        assert_eq!(store.unpublished_count().await.unwrap(), 0);
        tx.commit().unwrap();
        assert_eq!(store.unpublished_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dropped_transaction_discards_events() {
        let store = InMemoryOutboxStore::new();
        {
            let mut tx = store.begin();
            tx.append(new_event("alert.closed")).unwrap();
        }
        assert!(store.all().is_empty());
    }

    #[tokio::test]
    async fn concurrent_claims_skip_locked_rows() {
        let store = InMemoryOutboxStore::new();
        store.append((0..4).map(|_| new_event("alert.closed")).collect()).unwrap();

        let first = store.claim(&Watermark::start(), 3).await.unwrap();
        let second = store.claim(&Watermark::start(), 3).await.unwrap();

        assert_eq!(first.events().len(), 3);
        assert_eq!(second.events().len(), 1);
        let overlap = first
            .events()
            .iter()
            .any(|a| second.events().iter().any(|b| a.event_id == b.event_id));
        assert!(!overlap);
    }

    #[tokio::test]
    async fn dropped_claim_releases_rows_unpublished() {
        let store = InMemoryOutboxStore::new();
        store.append(vec![new_event("alert.closed")]).unwrap();

        let mut claim = store.claim(&Watermark::start(), 10).await.unwrap();
        let id = claim.events()[0].event_id;
        claim.mark_published(id);
        drop(claim);

        let again = store.claim(&Watermark::start(), 10).await.unwrap();
        assert_eq!(again.events().len(), 1);
        assert!(!store.get(id).unwrap().published);
    }

    #[tokio::test]
    async fn commit_flips_only_marked_rows() {
        let store = InMemoryOutboxStore::new();
        let ids = store.append(vec![new_event("a"), new_event("b")]).unwrap();

        let mut claim = store.claim(&Watermark::start(), 10).await.unwrap();
        claim.mark_published(ids[1]);
        assert_eq!(claim.commit().await.unwrap(), 1);

        assert!(!store.get(ids[0]).unwrap().published);
        assert!(store.get(ids[1]).unwrap().published);
        assert_eq!(store.unpublished_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn late_commit_of_early_id_sorts_after_earlier_commit() {
        let store = InMemoryOutboxStore::new();
        let mut slow = store.begin();
        let early_id = slow.append(new_event("alert.closed")).unwrap();

        let late_id = store.append(vec![new_event("alert.closed")]).unwrap()[0];
        slow.commit().unwrap();

        assert!(early_id < late_id);
        let claim = store.claim(&Watermark::start(), 10).await.unwrap();
        let order: Vec<EventId> = claim.events().iter().map(|e| e.event_id).collect();
        assert_eq!(order, vec![late_id, early_id]);
    }
}
