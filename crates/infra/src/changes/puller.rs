//! Lease-guarded, paginated change pull with checkpointing.
//!
//! A pull is a lazy stream of non-empty [`ChangeBatch`]es. Nothing touches the
//! lock, journal, or upstream until the first [`ChangeStream::next`]. The new
//! data token is persisted only after the consumer asks for the batch
//! following the last one, so an abandoned or failed consumer never advances
//! the checkpoint past data it did not process.

use futures::Stream;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::journal::{ChangeJournalStore, JournalError};
use super::source::{ChangeBatch, ChangeRequest, ChangeSource, MAX_PAGE_SIZE, SourceError};
use crate::lock::{Lease, LockError, LockProvider};

#[derive(Debug, Error)]
pub enum PullError {
    #[error("page size {0} outside 1..={MAX_PAGE_SIZE}")]
    InvalidPageSize(u32),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("pull cancelled")]
    Cancelled,
}

/// Outcome of one pull, logged when the stream ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullSummary {
    pub pages: u32,
    pub batches: u32,
    pub items: u64,
    pub full_sync: bool,
    pub restarts: u32,
    pub final_page_size: u32,
    pub checkpointed: bool,
}

pub fn lock_key(key: &str, entity_name: &str) -> String {
    format!("change-journal:{key}:{entity_name}")
}

pub struct ChangePuller<S, J, L> {
    source: S,
    journal: J,
    locks: L,
}

impl<S, J, L> ChangePuller<S, J, L>
where
    S: ChangeSource,
    J: ChangeJournalStore,
    L: LockProvider,
{
    pub fn new(source: S, journal: J, locks: L) -> Self {
        Self {
            source,
            journal,
            locks,
        }
    }

    pub fn journal(&self) -> &J {
        &self.journal
    }

    /// Prepare a pull of `entity_name` under `key`.
    ///
    /// Cancellation is observed between pages.
    pub fn pull(
        &self,
        key: impl Into<String>,
        entity_name: impl Into<String>,
        columns: Vec<String>,
        page_size: u32,
        cancel: CancellationToken,
    ) -> Result<ChangeStream<'_, S, J, L>, PullError> {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(PullError::InvalidPageSize(page_size));
        }

        Ok(ChangeStream {
            puller: self,
            key: key.into(),
            entity_name: entity_name.into(),
            columns,
            page_size,
            page_number: 1,
            paging_cookie: None,
            data_token: None,
            cancel,
            phase: Phase::Idle,
            summary: PullSummary::default(),
            reported: false,
        })
    }
}

enum Phase {
    Idle,
    Pulling(Lease),
    /// Final page handed out; save `token` once the consumer comes back.
    Checkpoint { lease: Lease, token: Option<String> },
    Done,
}

pub struct ChangeStream<'a, S, J, L> {
    puller: &'a ChangePuller<S, J, L>,
    key: String,
    entity_name: String,
    columns: Vec<String>,
    page_size: u32,
    page_number: u32,
    paging_cookie: Option<String>,
    data_token: Option<String>,
    cancel: CancellationToken,
    phase: Phase,
    summary: PullSummary,
    reported: bool,
}

impl<'a, S, J, L> ChangeStream<'a, S, J, L>
where
    S: ChangeSource,
    J: ChangeJournalStore,
    L: LockProvider,
{
    pub fn summary(&self) -> &PullSummary {
        &self.summary
    }

    /// Next non-empty batch, or `None` once the pass is complete (or the
    /// lease is held elsewhere). Errors end the stream and release the lease.
    pub async fn next(&mut self) -> Result<Option<ChangeBatch>, PullError> {
        let result = self.advance().await;
        if self.reported || !matches!(self.phase, Phase::Done) {
            return result;
        }

        match &result {
            Err(e) => {
                self.reported = true;
                warn!(
                    key = %self.key,
                    entity_name = %self.entity_name,
                    error = %e,
                    summary = ?self.summary,
                    "change pull aborted"
                );
            }
            Ok(None) if self.summary.pages > 0 => {
                self.reported = true;
                info!(
                    key = %self.key,
                    entity_name = %self.entity_name,
                    pages = self.summary.pages,
                    batches = self.summary.batches,
                    items = self.summary.items,
                    full_sync = self.summary.full_sync,
                    restarts = self.summary.restarts,
                    page_size = self.summary.final_page_size,
                    checkpointed = self.summary.checkpointed,
                    "change pull finished"
                );
            }
            _ => {}
        }
        result
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<ChangeBatch, PullError>> + 'a
    where
        S: 'a,
        J: 'a,
        L: 'a,
    {
        futures::stream::try_unfold(self, |mut stream| async move {
            let batch = stream.next().await?;
            Ok::<_, PullError>(batch.map(|batch| (batch, stream)))
        })
    }

    async fn advance(&mut self) -> Result<Option<ChangeBatch>, PullError> {
        loop {
            // Every early return below leaves the phase at `Done`, dropping the lease.
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Done => return Ok(None),
                Phase::Idle => {
                    let lock_key = lock_key(&self.key, &self.entity_name);
                    let Some(lease) = self.puller.locks.try_acquire(&lock_key).await? else {
                        info!(key = %self.key, entity_name = %self.entity_name, "change journal lease held elsewhere; skipping pull");
                        return Ok(None);
                    };
                    self.data_token = self.puller.journal.load(&self.key, &self.entity_name).await?;
                    self.summary.full_sync = self.data_token.is_none();
                    self.phase = Phase::Pulling(lease);
                }
                Phase::Checkpoint { lease, token } => {
                    self.checkpoint(token).await?;
                    drop(lease);
                    return Ok(None);
                }
                Phase::Pulling(lease) => {
                    if self.cancel.is_cancelled() {
                        return Err(PullError::Cancelled);
                    }
                    if let Some(batch) = self.pull_page(lease).await? {
                        return Ok(Some(batch));
                    }
                }
            }
        }
    }

    /// Fetch one page and set the next phase. Returns a batch only when the
    /// page carried items.
    async fn pull_page(&mut self, lease: Lease) -> Result<Option<ChangeBatch>, PullError> {
        let request = ChangeRequest {
            entity_name: self.entity_name.clone(),
            columns: self.columns.clone(),
            page_size: self.page_size,
            page_number: self.page_number,
            paging_cookie: self.paging_cookie.clone(),
            data_token: self.data_token.clone(),
        };
        self.summary.final_page_size = self.page_size;

        let page = match self.puller.source.retrieve_changes(&request).await {
            Ok(page) => page,
            Err(SourceError::ExpiredVersion(reason)) if self.data_token.is_some() => {
                warn!(
                    key = %self.key,
                    entity_name = %self.entity_name,
                    %reason,
                    "data token expired; restarting with a full sync"
                );
                self.data_token = None;
                self.summary.full_sync = true;
                self.restart(lease);
                return Ok(None);
            }
            Err(SourceError::ResourceExhausted(reason)) if self.page_size > 1 => {
                let halved = (self.page_size / 2).max(1);
                warn!(
                    key = %self.key,
                    entity_name = %self.entity_name,
                    page_size = self.page_size,
                    next_page_size = halved,
                    %reason,
                    "upstream exhausted; halving page size"
                );
                self.page_size = halved;
                self.restart(lease);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        self.summary.pages += 1;
        debug!(
            entity_name = %self.entity_name,
            page = request.page_number,
            page_size = request.page_size,
            items = page.items.len(),
            more_records = page.more_records,
            "retrieved change page"
        );

        if page.more_records {
            self.page_number += 1;
            self.paging_cookie = page.paging_cookie;
            self.phase = Phase::Pulling(lease);
        } else {
            self.phase = Phase::Checkpoint {
                lease,
                token: page.data_token,
            };
        }

        if page.items.is_empty() {
            return Ok(None);
        }

        self.summary.batches += 1;
        self.summary.items += page.items.len() as u64;
        Ok(Some(ChangeBatch {
            entity_name: self.entity_name.clone(),
            page_number: request.page_number,
            items: page.items,
        }))
    }

    fn restart(&mut self, lease: Lease) {
        self.summary.restarts += 1;
        self.page_number = 1;
        self.paging_cookie = None;
        self.phase = Phase::Pulling(lease);
    }

    async fn checkpoint(&mut self, token: Option<String>) -> Result<(), PullError> {
        if self.summary.batches == 0 {
            return Ok(());
        }
        let Some(token) = token else {
            warn!(key = %self.key, entity_name = %self.entity_name, "final page carried no data token; checkpoint skipped");
            return Ok(());
        };
        self.puller
            .journal
            .save(&self.key, &self.entity_name, &token)
            .await?;
        self.summary.checkpointed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use futures::TryStreamExt;
    use serde_json::Map;

    use super::*;
    use crate::changes::{ChangeItem, ChangePage, InMemoryChangeJournal};
    use crate::lock::InMemoryLockProvider;

    #[derive(Default)]
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<ChangePage, SourceError>>>,
        requests: Mutex<Vec<ChangeRequest>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<ChangePage, SourceError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::default(),
            })
        }

        fn requests(&self) -> Vec<ChangeRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChangeSource for ScriptedSource {
        async fn retrieve_changes(&self, request: &ChangeRequest) -> Result<ChangePage, SourceError> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SourceError::Other("script exhausted".into())))
        }
    }

    fn items(ids: &[&str]) -> Vec<ChangeItem> {
        ids.iter()
            .map(|id| ChangeItem::NewOrUpdated {
                id: id.to_string(),
                attributes: Map::new(),
            })
            .collect()
    }

    fn page(ids: &[&str], cookie: &str) -> Result<ChangePage, SourceError> {
        Ok(ChangePage {
            items: items(ids),
            more_records: true,
            paging_cookie: Some(cookie.into()),
            data_token: None,
        })
    }

    fn last_page(ids: &[&str], token: &str) -> Result<ChangePage, SourceError> {
        Ok(ChangePage {
            items: items(ids),
            more_records: false,
            paging_cookie: None,
            data_token: Some(token.into()),
        })
    }

    type TestPuller = ChangePuller<Arc<ScriptedSource>, Arc<InMemoryChangeJournal>, InMemoryLockProvider>;

    fn puller(source: Arc<ScriptedSource>) -> (TestPuller, Arc<InMemoryChangeJournal>, InMemoryLockProvider) {
        let journal = Arc::new(InMemoryChangeJournal::new());
        let locks = InMemoryLockProvider::new();
        (ChangePuller::new(source, journal.clone(), locks.clone()), journal, locks)
    }

    fn cols() -> Vec<String> {
        vec!["fullname".into(), "email".into()]
    }

    #[tokio::test]
    async fn full_sync_yields_pages_then_checkpoints() {
        let source = ScriptedSource::new(vec![
            page(&["1", "2"], "c1"),
            page(&["3"], "c2"),
            last_page(&["4"], "tok-1"),
        ]);
        let (puller, journal, locks) = puller(source.clone());

        let batches: Vec<ChangeBatch> = puller
            .pull("crm", "contact", cols(), 2, CancellationToken::new())
            .unwrap()
            .into_stream()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(batches.len(), 3);
        assert_eq!(batches.iter().map(|b| b.page_number).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(journal.load("crm", "contact").await.unwrap().as_deref(), Some("tok-1"));
        assert!(!locks.is_held(&lock_key("crm", "contact")));

        let requests = source.requests();
        assert_eq!(requests[0].data_token, None);
        assert_eq!(requests[1].paging_cookie.as_deref(), Some("c1"));
        assert_eq!(requests[2].page_number, 3);
    }

    #[tokio::test]
    async fn incremental_pull_sends_stored_token() {
        let source = ScriptedSource::new(vec![last_page(&["9"], "tok-2")]);
        let (puller, journal, _) = puller(source.clone());
        journal.save("crm", "contact", "tok-1").await.unwrap();

        let mut stream = puller.pull("crm", "contact", cols(), 100, CancellationToken::new()).unwrap();
        assert!(stream.next().await.unwrap().is_some());
        assert!(stream.next().await.unwrap().is_none());

        assert_eq!(source.requests()[0].data_token.as_deref(), Some("tok-1"));
        assert_eq!(journal.load("crm", "contact").await.unwrap().as_deref(), Some("tok-2"));
        assert!(stream.summary().checkpointed);
    }

    #[tokio::test]
    async fn empty_pass_yields_nothing_and_keeps_old_token() {
        let source = ScriptedSource::new(vec![last_page(&[], "tok-new")]);
        let (puller, journal, _) = puller(source);
        journal.save("crm", "contact", "tok-old").await.unwrap();

        let mut stream = puller.pull("crm", "contact", cols(), 10, CancellationToken::new()).unwrap();
        assert!(stream.next().await.unwrap().is_none());
        assert_eq!(journal.load("crm", "contact").await.unwrap().as_deref(), Some("tok-old"));
    }

    #[tokio::test]
    async fn held_lease_produces_an_empty_stream() {
        let source = ScriptedSource::new(vec![last_page(&["1"], "t")]);
        let (puller, _, locks) = puller(source.clone());
        let _other = locks.try_acquire(&lock_key("crm", "contact")).await.unwrap().unwrap();

        let mut stream = puller.pull("crm", "contact", cols(), 10, CancellationToken::new()).unwrap();
        assert!(stream.next().await.unwrap().is_none());
        assert!(source.requests().is_empty());
    }

    #[tokio::test]
    async fn pull_is_lazy_until_first_next() {
        let source = ScriptedSource::new(vec![last_page(&["1"], "t")]);
        let (puller, _, locks) = puller(source.clone());

        let stream = puller.pull("crm", "contact", cols(), 10, CancellationToken::new()).unwrap();
        assert!(!locks.is_held(&lock_key("crm", "contact")));
        assert!(source.requests().is_empty());
        drop(stream);
    }

    #[tokio::test]
    async fn expired_token_restarts_as_full_sync() {
        let source = ScriptedSource::new(vec![
            page(&["1"], "c1"),
            Err(SourceError::ExpiredVersion("too old".into())),
            last_page(&["1", "2"], "fresh"),
        ]);
        let (puller, journal, _) = puller(source.clone());
        journal.save("crm", "contact", "stale").await.unwrap();

        let mut stream = puller.pull("crm", "contact", cols(), 10, CancellationToken::new()).unwrap();
        while stream.next().await.unwrap().is_some() {}

        let requests = source.requests();
        assert_eq!(requests[2].data_token, None);
        assert_eq!(requests[2].page_number, 1);
        assert_eq!(requests[2].paging_cookie, None);
        assert_eq!(stream.summary().restarts, 1);
        assert_eq!(journal.load("crm", "contact").await.unwrap().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn exhaustion_halves_page_size_and_restarts() {
        let source = ScriptedSource::new(vec![
            page(&["1"], "c1"),
            Err(SourceError::ResourceExhausted("busy".into())),
            last_page(&["1"], "t"),
        ]);
        let (puller, _, _) = puller(source.clone());

        let mut stream = puller.pull("crm", "contact", cols(), 5000, CancellationToken::new()).unwrap();
        while stream.next().await.unwrap().is_some() {}

        let requests = source.requests();
        assert_eq!(requests[1].page_size, 5000);
        assert_eq!(requests[2].page_size, 2500);
        assert_eq!(requests[2].page_number, 1);
        assert_eq!(requests[2].paging_cookie, None);
    }

    #[tokio::test]
    async fn exhaustion_at_page_size_one_is_fatal() {
        let source = ScriptedSource::new(vec![Err(SourceError::ResourceExhausted("busy".into()))]);
        let (puller, _, locks) = puller(source);

        let mut stream = puller.pull("crm", "contact", cols(), 1, CancellationToken::new()).unwrap();
        let err = stream.next().await.unwrap_err();
        assert!(matches!(err, PullError::Source(SourceError::ResourceExhausted(_))));
        assert!(!locks.is_held(&lock_key("crm", "contact")));
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn page_size_is_validated() {
        let (puller, _, _) = puller(ScriptedSource::new(vec![]));
        assert!(matches!(
            puller.pull("k", "e", cols(), 0, CancellationToken::new()),
            Err(PullError::InvalidPageSize(0))
        ));
        assert!(matches!(
            puller.pull("k", "e", cols(), MAX_PAGE_SIZE + 1, CancellationToken::new()),
            Err(PullError::InvalidPageSize(_))
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_without_checkpoint() {
        let source = ScriptedSource::new(vec![page(&["1"], "c1"), last_page(&["2"], "t")]);
        let (puller, journal, locks) = puller(source.clone());
        let cancel = CancellationToken::new();

        let mut stream = puller.pull("crm", "contact", cols(), 10, cancel.clone()).unwrap();
        assert!(stream.next().await.unwrap().is_some());
        cancel.cancel();

        assert!(matches!(stream.next().await, Err(PullError::Cancelled)));
        assert_eq!(source.requests().len(), 1);
        assert_eq!(journal.load("crm", "contact").await.unwrap(), None);
        assert!(!locks.is_held(&lock_key("crm", "contact")));
    }

    #[tokio::test]
    async fn abandoned_consumer_does_not_advance_checkpoint() {
        let source = ScriptedSource::new(vec![last_page(&["1"], "t")]);
        let (puller, journal, locks) = puller(source);

        let mut stream = puller.pull("crm", "contact", cols(), 10, CancellationToken::new()).unwrap();
        assert!(stream.next().await.unwrap().is_some());
        assert!(locks.is_held(&lock_key("crm", "contact")));
        drop(stream);

        assert_eq!(journal.load("crm", "contact").await.unwrap(), None);
        assert!(!locks.is_held(&lock_key("crm", "contact")));
    }
}
