//! Incremental change retrieval from an upstream change-tracking API.
//!
//! The upstream hands out an opaque data token at the end of every complete
//! pass. Passing the token back on the next pass returns only rows changed
//! since. The journal persists that token per `(key, entity_name)`.

pub mod journal;
pub mod puller;
pub mod source;

pub use journal::{ChangeJournalStore, InMemoryChangeJournal, JournalError, PostgresChangeJournal};
pub use puller::{ChangePuller, ChangeStream, PullError, PullSummary};
pub use source::{
    ChangeBatch, ChangeItem, ChangePage, ChangeRequest, ChangeSource, MAX_PAGE_SIZE, SourceError,
};
