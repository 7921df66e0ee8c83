//! Postgres advisory-lock provider.
//!
//! Each lease owns a transaction holding a transaction-scoped advisory lock.
//! Dropping the lease drops the transaction, which rolls back and releases the
//! lock. If the process dies, the server releases it with the session.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use super::{Lease, LockError, LockProvider};

/// First half of the two-key advisory lock space reserved for this service.
const LOCK_NAMESPACE: i32 = 0x636f_7572;

#[derive(Debug, Clone)]
pub struct PostgresLockProvider {
    pool: PgPool,
}

impl PostgresLockProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockProvider for PostgresLockProvider {
    #[instrument(skip(self), err)]
    async fn try_acquire(&self, key: &str) -> Result<Option<Lease>, LockError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LockError::Backend(format!("begin lock transaction: {e}")))?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1, hashtext($2))")
            .bind(LOCK_NAMESPACE)
            .bind(key)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| LockError::Backend(format!("pg_try_advisory_xact_lock: {e}")))?;

        if !acquired {
            // Nothing was written; a failed rollback just returns the connection dirty.
            let _ = tx.rollback().await;
            return Ok(None);
        }

        Ok(Some(Lease::new(key, tx)))
    }
}
