//! Outbox publisher: claim, observe, mark published.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::observer::EventObserver;
use super::r#trait::{OutboxClaim, OutboxError, OutboxStore, StoredEvent, Watermark};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Rows claimed per transaction.
    pub batch_size: usize,
    /// Keep claiming until a batch comes back empty instead of stopping at
    /// the first partial batch. Closes the under-drain gap when several
    /// publishers claim concurrently.
    pub strict_drain: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            strict_drain: false,
        }
    }
}

impl PublisherConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_strict_drain(mut self, strict: bool) -> Self {
        self.strict_drain = strict;
        self
    }
}

/// Counters for one `drain` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub batches: u32,
    pub claimed: u64,
    pub published: u64,
    pub failed: u64,
}

pub struct OutboxPublisher<S> {
    store: S,
    observers: Vec<Arc<dyn EventObserver>>,
    config: PublisherConfig,
}

impl<S: OutboxStore> OutboxPublisher<S> {
    pub fn new(store: S, config: PublisherConfig) -> Self {
        Self {
            store,
            observers: Vec::new(),
            config,
        }
    }

    pub fn with_observer<O: EventObserver + 'static>(mut self, observer: O) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    pub fn add_observer(&mut self, observer: Arc<dyn EventObserver>) {
        self.observers.push(observer);
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Publish everything currently claimable.
    ///
    /// Safe to call repeatedly and from several processes at once. An event
    /// whose observer chain fails stays unpublished and is retried by the
    /// next call; the rest of the queue is not held up. Cancellation is
    /// observed between batches.
    #[instrument(skip(self, cancel), fields(batch_size = self.config.batch_size), err)]
    pub async fn drain(&self, cancel: &CancellationToken) -> Result<DrainReport, OutboxError> {
        let batch_size = self.config.batch_size.max(1);
        let mut watermark = Watermark::start();
        let mut report = DrainReport::default();

        while !cancel.is_cancelled() {
            let mut claim = self.store.claim(&watermark, batch_size).await?;
            let events = claim.events().to_vec();
            report.batches += 1;
            report.claimed += events.len() as u64;

            for event in &events {
                watermark = event.watermark();
                match self.notify(event).await {
                    Ok(()) => {
                        claim.mark_published(event.event_id);
                        report.published += 1;
                    }
                    Err(reason) => {
                        report.failed += 1;
                        warn!(
                            event_id = %event.event_id,
                            event_name = %event.event_name,
                            %reason,
                            "outbox event not published; will retry on next drain"
                        );
                    }
                }
            }

            claim.commit().await?;

            let more = if self.config.strict_drain {
                !events.is_empty()
            } else {
                events.len() == batch_size
            };
            if !more {
                break;
            }
        }

        debug!(?report, "outbox drain complete");
        Ok(report)
    }

    async fn notify(&self, event: &StoredEvent) -> Result<(), String> {
        let envelope = event.decode().map_err(|e| e.to_string())?;
        for observer in &self.observers {
            observer
                .on_event_saved(&envelope)
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    /// Drain on a fixed timer until cancelled.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "outbox publisher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.drain(&cancel).await {
                Ok(report) if report.claimed > 0 => info!(
                    claimed = report.claimed,
                    published = report.published,
                    failed = report.failed,
                    batches = report.batches,
                    "outbox drained"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "outbox drain failed"),
            }
        }

        info!("outbox publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use courier_core::{EventId, OwnerId};
    use courier_events::{AlertClosed, DomainEvent, EventEnvelope};

    use super::*;
    use crate::outbox::{InMemoryOutboxStore, NewEvent, ObserverError};

    /// Records every event it sees and fails for the ids in `failing`.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<EventId>>,
        failing: Mutex<Vec<EventId>>,
    }

    #[async_trait]
    impl EventObserver for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_event_saved(&self, event: &EventEnvelope<DomainEvent>) -> Result<(), ObserverError> {
            self.seen.lock().unwrap().push(event.event_id());
            if self.failing.lock().unwrap().contains(&event.event_id()) {
                return Err(ObserverError::new("recorder", "boom"));
            }
            Ok(())
        }
    }

    fn closed() -> NewEvent {
        NewEvent::from_domain(
            &AlertClosed {
                alert_id: Uuid::now_v7(),
                owner_id: OwnerId::new(),
                reason: None,
                occurred_at: Utc::now(),
            }
            .into(),
        )
        .unwrap()
    }

    fn seed(store: &InMemoryOutboxStore, n: usize) -> Vec<EventId> {
        store.append((0..n).map(|_| closed()).collect()).unwrap()
    }

    #[tokio::test]
    async fn unknown_event_names_stay_unpublished() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let ids = store
            .append(vec![NewEvent {
                event_name: "alert.exploded".into(),
                payload: serde_json::json!({}),
                created: Utc::now(),
            }])
            .unwrap();

        let publisher = OutboxPublisher::new(store.clone(), PublisherConfig::default())
            .with_observer(Recorder::default());
        let report = publisher.drain(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.failed, 1);
        assert!(!store.get(ids[0]).unwrap().published);
    }

    #[tokio::test]
    async fn partial_chain_failure_keeps_event_unpublished() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let ids = seed(&store, 2);
        let failing = Recorder::default();
        failing.failing.lock().unwrap().push(ids[0]);
        let first = Arc::new(Recorder::default());

        let publisher = OutboxPublisher::new(store.clone(), PublisherConfig::default())
            .with_observer(first.clone())
            .with_observer(failing);
        publisher.drain(&CancellationToken::new()).await.unwrap();

        assert!(!store.get(ids[0]).unwrap().published);
        assert!(store.get(ids[1]).unwrap().published);
        assert_eq!(first.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn strict_drain_continues_past_partial_batches() {
        let store = Arc::new(InMemoryOutboxStore::new());
        seed(&store, 5);
        // A concurrent claimer holds two rows, so the first batch comes back short.
        let held = store.claim(&Watermark::start(), 2).await.unwrap();

        let publisher = OutboxPublisher::new(
            store.clone(),
            PublisherConfig::default().with_batch_size(4).with_strict_drain(true),
        );
        let report = publisher.drain(&CancellationToken::new()).await.unwrap();
        drop(held);

        assert_eq!(report.published, 3);
        assert_eq!(report.batches, 2);
        assert_eq!(store.unpublished_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn default_drain_stops_on_a_partial_batch() {
        let store = Arc::new(InMemoryOutboxStore::new());
        seed(&store, 5);
        let held = store.claim(&Watermark::start(), 2).await.unwrap();

        let publisher = OutboxPublisher::new(store.clone(), PublisherConfig::default().with_batch_size(4));
        let report = publisher.drain(&CancellationToken::new()).await.unwrap();

        // Only three rows were claimable, so the short batch ends the drain.
        assert_eq!(report.batches, 1);
        assert_eq!(report.published, 3);
        drop(held);
        assert_eq!(store.unpublished_count().await.unwrap(), 2);

        let next = publisher.drain(&CancellationToken::new()).await.unwrap();
        assert_eq!(next.published, 2);
        assert_eq!(store.unpublished_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_token_claims_nothing() {
        let store = Arc::new(InMemoryOutboxStore::new());
        seed(&store, 3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let publisher = OutboxPublisher::new(store.clone(), PublisherConfig::default());
        let report = publisher.drain(&cancel).await.unwrap();

        assert_eq!(report, DrainReport::default());
        assert_eq!(store.unpublished_count().await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_on_each_tick_until_cancelled() {
        let store = Arc::new(InMemoryOutboxStore::new());
        seed(&store, 1);
        let publisher = Arc::new(OutboxPublisher::new(store.clone(), PublisherConfig::default()));
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            async move { publisher.run(Duration::from_secs(60), cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.unpublished_count().await.unwrap(), 0);

        seed(&store, 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.unpublished_count().await.unwrap(), 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
