//! Polls for due webhook messages and delivers them.
//!
//! Each message is delivered in its own task. A semaphore per endpoint bounds
//! how many sends one subscriber can have in flight, so a slow or failing
//! endpoint only delays its own queue.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_core::{EndpointId, MessageId};

use super::retry::RetryPolicy;
use super::sender::{DeliveryError, WebhookSender};
use super::store::{WebhookStore, WebhookStoreError};
use super::types::WebhookMessage;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Messages claimed per poll.
    pub batch_size: usize,
    pub per_endpoint_concurrency: usize,
    /// How long a claimed message stays hidden from other schedulers.
    pub claim_lease: Duration,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            per_endpoint_concurrency: 2,
            claim_lease: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome counters for one tick (or a whole run).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub delivered: usize,
    pub rescheduled: usize,
    pub dead: usize,
    /// Cancelled or hit a store error; retried once the claim lease lapses.
    pub interrupted: usize,
    /// Claim lapsed while waiting for a send slot and another scheduler
    /// took the message over; not sent here.
    pub superseded: usize,
}

impl TickReport {
    fn record(&mut self, joined: Result<Outcome, JoinError>) {
        match joined {
            Ok(Outcome::Delivered) => self.delivered += 1,
            Ok(Outcome::Rescheduled) => self.rescheduled += 1,
            Ok(Outcome::Dead) => self.dead += 1,
            Ok(Outcome::Interrupted) => self.interrupted += 1,
            Ok(Outcome::Superseded) => self.superseded += 1,
            Err(e) => {
                error!(error = %e, "webhook delivery task failed");
                self.interrupted += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Rescheduled,
    Dead,
    Interrupted,
    Superseded,
}

type InFlight = Arc<Mutex<HashSet<MessageId>>>;

/// Removes a message from the in-flight set when its task ends.
struct InFlightGuard {
    set: InFlight,
    message_id: MessageId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.message_id);
        }
    }
}

pub struct WebhookScheduler<W, H> {
    store: Arc<W>,
    sender: Arc<H>,
    config: SchedulerConfig,
    limits: Mutex<HashMap<EndpointId, Arc<Semaphore>>>,
    in_flight: InFlight,
}

impl<W, H> WebhookScheduler<W, H>
where
    W: WebhookStore + 'static,
    H: WebhookSender + 'static,
{
    pub fn new(store: Arc<W>, sender: Arc<H>, config: SchedulerConfig) -> Self {
        Self {
            store,
            sender,
            config,
            limits: Mutex::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn limit_for(&self, endpoint_id: EndpointId) -> Arc<Semaphore> {
        let permits = self.config.per_endpoint_concurrency.max(1);
        match self.limits.lock() {
            Ok(mut limits) => limits
                .entry(endpoint_id)
                .or_insert_with(|| Arc::new(Semaphore::new(permits)))
                .clone(),
            Err(_) => Arc::new(Semaphore::new(permits)),
        }
    }

    /// Drop semaphores no delivery task holds any more.
    fn evict_idle_limits(&self) {
        if let Ok(mut limits) = self.limits.lock() {
            limits.retain(|_, limit| Arc::strong_count(limit) > 1);
        }
    }

    #[cfg(test)]
    fn tracked_endpoints(&self) -> usize {
        self.limits.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Claim due messages and spawn a delivery task for each one not already
    /// in flight. Returns the number spawned.
    async fn spawn_due(
        &self,
        tasks: &mut JoinSet<Outcome>,
        cancel: &CancellationToken,
    ) -> Result<usize, WebhookStoreError> {
        let due = self
            .store
            .claim_due(Utc::now(), self.config.batch_size.max(1), self.config.claim_lease)
            .await?;

        let mut spawned = 0;
        for message in due {
            let guard = {
                let Ok(mut set) = self.in_flight.lock() else {
                    continue;
                };
                if !set.insert(message.message_id) {
                    continue;
                }
                InFlightGuard {
                    set: self.in_flight.clone(),
                    message_id: message.message_id,
                }
            };

            let limit = self.limit_for(message.endpoint_id);
            let store = self.store.clone();
            let sender = self.sender.clone();
            let retry = self.config.retry.clone();
            let lease = self.config.claim_lease;
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _guard = guard;
                deliver(store, sender, retry, lease, limit, message, cancel).await
            });
            spawned += 1;
        }
        Ok(spawned)
    }

    /// Deliver everything currently due and wait for the results.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickReport, WebhookStoreError> {
        let mut tasks = JoinSet::new();
        let mut report = TickReport {
            claimed: self.spawn_due(&mut tasks, cancel).await?,
            ..TickReport::default()
        };
        while let Some(joined) = tasks.join_next().await {
            report.record(joined);
        }
        self.evict_idle_limits();
        Ok(report)
    }

    /// Poll until cancelled. Deliveries run in the background across polls,
    /// so one slow endpoint never delays the next poll.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();
        let mut totals = TickReport::default();
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            per_endpoint_concurrency = self.config.per_endpoint_concurrency,
            "webhook scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            while let Some(joined) = tasks.try_join_next() {
                totals.record(joined);
            }
            self.evict_idle_limits();
            match self.spawn_due(&mut tasks, &cancel).await {
                Ok(0) => {}
                Ok(n) => {
                    totals.claimed += n;
                    debug!(spawned = n, in_flight = tasks.len(), "webhook deliveries started");
                }
                Err(e) => error!(error = %e, "failed to claim due webhook messages"),
            }
        }

        // In-flight sends observe the token and return promptly.
        while let Some(joined) = tasks.join_next().await {
            totals.record(joined);
        }
        info!(
            claimed = totals.claimed,
            delivered = totals.delivered,
            rescheduled = totals.rescheduled,
            dead = totals.dead,
            interrupted = totals.interrupted,
            superseded = totals.superseded,
            "webhook scheduler stopped"
        );
    }
}

async fn deliver<W, H>(
    store: Arc<W>,
    sender: Arc<H>,
    retry: RetryPolicy,
    claim_lease: Duration,
    limit: Arc<Semaphore>,
    message: WebhookMessage,
    cancel: CancellationToken,
) -> Outcome
where
    W: WebhookStore,
    H: WebhookSender,
{
    let _permit = tokio::select! {
        permit = limit.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return Outcome::Interrupted,
        },
        _ = cancel.cancelled() => return Outcome::Interrupted,
    };

    // The claim lease started at poll time; restart it now that a send slot is ours.
    let lease = chrono::Duration::from_std(claim_lease).unwrap_or_else(|_| chrono::Duration::hours(1));
    match store
        .renew_lease(message.message_id, message.next_delivery_attempt, Utc::now() + lease)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            debug!(
                message_id = %message.message_id,
                endpoint_id = %message.endpoint_id,
                "claim lapsed while queued; message belongs to another scheduler"
            );
            return Outcome::Superseded;
        }
        Err(e) => {
            error!(message_id = %message.message_id, error = %e, "failed to renew webhook claim");
            return Outcome::Interrupted;
        }
    }

    let endpoint = match store.endpoint(message.endpoint_id).await {
        Ok(Some(endpoint)) if endpoint.enabled => endpoint,
        Ok(Some(_)) => return bury(&*store, &message, message.attempts, "endpoint disabled").await,
        Ok(None) => return bury(&*store, &message, message.attempts, "endpoint no longer exists").await,
        Err(e) => {
            error!(message_id = %message.message_id, error = %e, "failed to load webhook endpoint");
            return Outcome::Interrupted;
        }
    };

    let result = tokio::select! {
        result = sender.send(&endpoint, &message) => result,
        _ = cancel.cancelled() => Err(DeliveryError::Cancelled),
    };

    let now = Utc::now();
    let error = match result {
        Ok(()) => {
            return match store.mark_delivered(message.message_id, now).await {
                Ok(()) => Outcome::Delivered,
                Err(e) => {
                    error!(message_id = %message.message_id, error = %e, "delivered but failed to record it");
                    Outcome::Interrupted
                }
            };
        }
        Err(e) if !e.counts_as_attempt() => {
            debug!(message_id = %message.message_id, "webhook send cancelled");
            return Outcome::Interrupted;
        }
        Err(e) => e,
    };

    let attempts = message.attempts.saturating_add(1);
    let reason = error.to_string();
    match retry.next_attempt_at(attempts, message.jitter_salt(), now) {
        Some(next_attempt) => {
            debug!(
                message_id = %message.message_id,
                endpoint_id = %message.endpoint_id,
                attempts,
                %next_attempt,
                error = %reason,
                "webhook delivery failed; rescheduled"
            );
            match store.reschedule(message.message_id, attempts, next_attempt, &reason).await {
                Ok(()) => Outcome::Rescheduled,
                Err(e) => {
                    error!(message_id = %message.message_id, error = %e, "failed to reschedule webhook message");
                    Outcome::Interrupted
                }
            }
        }
        None => bury(&*store, &message, attempts, &reason).await,
    }
}

/// Move a message to `dead`.
async fn bury<W: WebhookStore + ?Sized>(store: &W, message: &WebhookMessage, attempts: u32, reason: &str) -> Outcome {
    warn!(
        message_id = %message.message_id,
        endpoint_id = %message.endpoint_id,
        cloud_event_id = %message.cloud_event_id,
        attempts,
        error = reason,
        "webhook message is dead"
    );
    match store.mark_dead(message.message_id, attempts, reason).await {
        Ok(()) => Outcome::Dead,
        Err(e) => {
            error!(message_id = %message.message_id, error = %e, "failed to mark webhook message dead");
            Outcome::Interrupted
        }
    }
}
