//! Change journal: the last data token per `(key, entity_name)`.
//!
//! Deleting a row (see [`ChangeJournalStore::reset`]) forces the next pull to
//! perform a full resync.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal storage error in {operation}: {message}")]
    Storage { operation: &'static str, message: String },

    #[error("journal lock poisoned")]
    Poisoned,
}

#[async_trait]
pub trait ChangeJournalStore: Send + Sync {
    async fn load(&self, key: &str, entity_name: &str) -> Result<Option<String>, JournalError>;

    /// Insert-if-absent else update.
    async fn save(&self, key: &str, entity_name: &str, data_token: &str) -> Result<(), JournalError>;

    /// Forget the token. Returns whether one existed.
    async fn reset(&self, key: &str, entity_name: &str) -> Result<bool, JournalError>;
}

#[async_trait]
impl<J> ChangeJournalStore for Arc<J>
where
    J: ChangeJournalStore + ?Sized,
{
    async fn load(&self, key: &str, entity_name: &str) -> Result<Option<String>, JournalError> {
        (**self).load(key, entity_name).await
    }

    async fn save(&self, key: &str, entity_name: &str, data_token: &str) -> Result<(), JournalError> {
        (**self).save(key, entity_name, data_token).await
    }

    async fn reset(&self, key: &str, entity_name: &str) -> Result<bool, JournalError> {
        (**self).reset(key, entity_name).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryChangeJournal {
    tokens: RwLock<HashMap<(String, String), String>>,
}

impl InMemoryChangeJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChangeJournalStore for InMemoryChangeJournal {
    async fn load(&self, key: &str, entity_name: &str) -> Result<Option<String>, JournalError> {
        let tokens = self.tokens.read().map_err(|_| JournalError::Poisoned)?;
        Ok(tokens.get(&(key.to_string(), entity_name.to_string())).cloned())
    }

    async fn save(&self, key: &str, entity_name: &str, data_token: &str) -> Result<(), JournalError> {
        let mut tokens = self.tokens.write().map_err(|_| JournalError::Poisoned)?;
        tokens.insert((key.to_string(), entity_name.to_string()), data_token.to_string());
        Ok(())
    }

    async fn reset(&self, key: &str, entity_name: &str) -> Result<bool, JournalError> {
        let mut tokens = self.tokens.write().map_err(|_| JournalError::Poisoned)?;
        Ok(tokens.remove(&(key.to_string(), entity_name.to_string())).is_some())
    }
}

/// Postgres-backed journal over the `change_journal` table.
#[derive(Debug, Clone)]
pub struct PostgresChangeJournal {
    pool: PgPool,
}

impl PostgresChangeJournal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage(operation: &'static str) -> impl FnOnce(sqlx::Error) -> JournalError {
    move |e| JournalError::Storage {
        operation,
        message: e.to_string(),
    }
}

#[async_trait]
impl ChangeJournalStore for PostgresChangeJournal {
    #[instrument(skip(self), err)]
    async fn load(&self, key: &str, entity_name: &str) -> Result<Option<String>, JournalError> {
        sqlx::query_scalar(
            r#"
            SELECT data_token
            FROM change_journal
            WHERE key = $1 AND entity_name = $2
            "#,
        )
        .bind(key)
        .bind(entity_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage("load"))
    }

    #[instrument(skip(self, data_token), err)]
    async fn save(&self, key: &str, entity_name: &str, data_token: &str) -> Result<(), JournalError> {
        sqlx::query(
            r#"
            INSERT INTO change_journal (key, entity_name, data_token)
            VALUES ($1, $2, $3)
            ON CONFLICT (key, entity_name)
            DO UPDATE SET
                data_token = EXCLUDED.data_token,
                updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(entity_name)
        .bind(data_token)
        .execute(&self.pool)
        .await
        .map_err(storage("save"))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn reset(&self, key: &str, entity_name: &str) -> Result<bool, JournalError> {
        let result = sqlx::query("DELETE FROM change_journal WHERE key = $1 AND entity_name = $2")
            .bind(key)
            .bind(entity_name)
            .execute(&self.pool)
            .await
            .map_err(storage("reset"))?;
        Ok(result.rows_affected() > 0)
    }
}
