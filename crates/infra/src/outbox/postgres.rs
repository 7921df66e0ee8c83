//! Postgres-backed outbox.
//!
//! ## Visibility
//!
//! Rows are written by [`PostgresOutboxStore::append`] inside the caller's
//! transaction, so they exist for the publisher only once that transaction
//! commits. `inserted` defaults to `clock_timestamp()`, the wall clock at
//! insert time, which is never earlier than the writing transaction's start.
//!
//! A transaction that inserts early and commits late would otherwise surface
//! a row below the watermark of a drain already past it. `claim` therefore
//! only hands out rows inserted before the start of the oldest other
//! transaction in this database that holds a transaction id (i.e. has
//! written something and not finished). Anything newer waits for a later
//! claim, once those writers have committed or rolled back.
//!
//! The horizon is read from `pg_stat_activity`, which only shows
//! `backend_xid` for sessions of roles the publisher is a member of (or all
//! of them with `pg_read_all_stats`). Writers under an unrelated role are
//! invisible to it and fall back to being picked up by the next drain.
//!
//! ## Claiming
//!
//! [`OutboxStore::claim`] opens a transaction and selects with
//! `FOR UPDATE SKIP LOCKED`. The claim owns the transaction; committing it
//! writes `published` and releases the row locks, dropping it rolls back.
//!
//! ## Error mapping
//!
//! | sqlx error | SQLSTATE | Mapped to |
//! |------------|----------|-----------|
//! | Database (unique violation) | `23505` | `Storage` (duplicate id) |
//! | Database (other) | any | `Storage` |
//! | PoolClosed | n/a | `Storage` |
//! | other | n/a | `Storage` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use courier_core::EventId;

use super::r#trait::{NewEvent, OutboxClaim, OutboxError, OutboxStore, StoredEvent, Watermark};

/// Unpublished rows past the watermark and below the in-flight writer horizon.
const CLAIM_SQL: &str = r#"
    WITH horizon AS (
        SELECT MIN(xact_start) AS at
        FROM pg_stat_activity
        WHERE backend_xid IS NOT NULL
          AND pid <> pg_backend_pid()
          AND datname = current_database()
    )
    SELECT e.event_id, e.event_name, e.payload, e.created, e.inserted, e.published
    FROM events e, horizon h
    WHERE e.published = FALSE
      AND (h.at IS NULL OR e.inserted < h.at)
      AND ($1::timestamptz IS NULL OR (e.inserted, e.created, e.event_id) > ($1, $2, $3))
    ORDER BY e.inserted, e.created, e.event_id
    LIMIT $4
    FOR UPDATE OF e SKIP LOCKED
"#;

#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Append events on the caller's connection (normally an open
    /// transaction carrying the matching state change).
    #[instrument(skip(conn, events), fields(event_count = events.len()), err)]
    pub async fn append(
        conn: &mut PgConnection,
        events: &[NewEvent],
    ) -> Result<Vec<EventId>, OutboxError> {
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO events (event_name, payload, created)
                VALUES ($1, $2, $3)
                RETURNING event_id
                "#,
            )
            .bind(&event.event_name)
            .bind(&event.payload)
            .bind(event.created)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("append", e))?;
            ids.push(EventId::new(id));
        }
        Ok(ids)
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    type Claim = PostgresClaim;

    #[instrument(skip(self), fields(claimed), err)]
    async fn claim(&self, after: &Watermark, limit: usize) -> Result<PostgresClaim, OutboxError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim.begin", e))?;

        let position = after.position();
        let rows = sqlx::query(CLAIM_SQL)
        .bind(position.map(|(inserted, _, _)| inserted))
        .bind(position.map(|(_, created, _)| created))
        .bind(position.map(|(_, _, id)| id.value()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let stored = StoredEventRow::from_row(&row)
                .map_err(|e| OutboxError::Storage(format!("failed to decode outbox row: {e}")))?;
            events.push(stored.into());
        }
        Span::current().record("claimed", events.len());

        Ok(PostgresClaim {
            tx,
            events,
            published: Vec::new(),
        })
    }

    #[instrument(skip(self), err)]
    async fn unpublished_count(&self) -> Result<u64, OutboxError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE published = FALSE")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("unpublished_count", e))?;
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self), err)]
    async fn oldest_unpublished(&self) -> Result<Option<DateTime<Utc>>, OutboxError> {
        sqlx::query_scalar("SELECT MIN(inserted) FROM events WHERE published = FALSE")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("oldest_unpublished", e))
    }
}

/// Locked outbox rows plus the transaction holding the locks.
pub struct PostgresClaim {
    tx: Transaction<'static, Postgres>,
    events: Vec<StoredEvent>,
    published: Vec<i64>,
}

impl std::fmt::Debug for PostgresClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresClaim")
            .field("events", &self.events.len())
            .field("published", &self.published)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl OutboxClaim for PostgresClaim {
    fn events(&self) -> &[StoredEvent] {
        &self.events
    }

    fn mark_published(&mut self, event_id: EventId) {
        if self.events.iter().any(|e| e.event_id == event_id) {
            self.published.push(event_id.value());
        }
    }

    #[instrument(skip(self), err)]
    async fn commit(mut self) -> Result<u64, OutboxError> {
        let mut flipped = 0;
        if !self.published.is_empty() {
            flipped = sqlx::query("UPDATE events SET published = TRUE WHERE event_id = ANY($1)")
                .bind(self.published.as_slice())
                .execute(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("mark_published", e))?
                .rows_affected();
        }
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("claim.commit", e))?;
        Ok(flipped)
    }
}

#[derive(Debug)]
struct StoredEventRow {
    event_id: i64,
    event_name: String,
    payload: JsonValue,
    created: DateTime<Utc>,
    inserted: DateTime<Utc>,
    published: bool,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for StoredEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            event_id: row.try_get("event_id")?,
            event_name: row.try_get("event_name")?,
            payload: row.try_get("payload")?,
            created: row.try_get("created")?,
            inserted: row.try_get("inserted")?,
            published: row.try_get("published")?,
        })
    }
}

impl From<StoredEventRow> for StoredEvent {
    fn from(row: StoredEventRow) -> Self {
        StoredEvent {
            event_id: EventId::new(row.event_id),
            event_name: row.event_name,
            payload: row.payload,
            created: row.created,
            inserted: row.inserted,
            published: row.published,
        }
    }
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned());
            match code.as_deref() {
                Some("23505") => OutboxError::Storage(format!(
                    "duplicate event in {operation}: {}",
                    db_err.message()
                )),
                _ => OutboxError::Storage(format!(
                    "database error in {operation}: {}",
                    db_err.message()
                )),
            }
        }
        sqlx::Error::PoolClosed => {
            OutboxError::Storage(format!("connection pool closed in {operation}"))
        }
        other => OutboxError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
