//! Distributed mutual exclusion for singleton work.
//!
//! A [`Lease`] is a scoped guard: the key is released when the lease drops,
//! whether the holder finished, failed, was cancelled, or was abandoned.

pub mod in_memory;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use in_memory::InMemoryLockProvider;
pub use postgres::PostgresLockProvider;
#[cfg(feature = "redis")]
pub use redis::RedisLockProvider;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),

    #[error("lock state poisoned")]
    Poisoned,
}

/// Held lock on a single key.
pub struct Lease {
    key: String,
    _guard: Box<dyn Send>,
}

impl Lease {
    /// Wrap a backend guard whose `Drop` releases `key`.
    pub fn new<G: Send + 'static>(key: impl Into<String>, guard: G) -> Self {
        Self {
            key: key.into(),
            _guard: Box::new(guard),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release now instead of at end of scope.
    pub fn release(self) {}
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("key", &self.key).finish_non_exhaustive()
    }
}

/// Non-blocking lock acquisition.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// `Ok(None)` means another holder currently owns `key`.
    async fn try_acquire(&self, key: &str) -> Result<Option<Lease>, LockError>;
}

#[async_trait]
impl<L> LockProvider for Arc<L>
where
    L: LockProvider + ?Sized,
{
    async fn try_acquire(&self, key: &str) -> Result<Option<Lease>, LockError> {
        (**self).try_acquire(key).await
    }
}
