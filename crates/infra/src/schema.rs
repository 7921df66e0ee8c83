//! Idempotent schema bootstrap.

use sqlx::PgPool;
use tracing::{info, instrument};

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        event_id    BIGSERIAL PRIMARY KEY,
        event_name  TEXT        NOT NULL,
        payload     JSONB       NOT NULL,
        created     TIMESTAMPTZ NOT NULL,
        inserted    TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
        published   BOOLEAN     NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_events_unpublished
        ON events (inserted, created, event_id)
        WHERE published = FALSE
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS change_journal (
        key         TEXT        NOT NULL,
        entity_name TEXT        NOT NULL,
        data_token  TEXT        NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (key, entity_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS webhook_endpoints (
        endpoint_id       UUID        PRIMARY KEY,
        owner_id          UUID        NOT NULL,
        address           TEXT        NOT NULL,
        api_version       TEXT        NOT NULL,
        cloud_event_types TEXT[]      NOT NULL DEFAULT '{}',
        enabled           BOOLEAN     NOT NULL DEFAULT TRUE,
        created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS webhook_messages (
        message_id            UUID        PRIMARY KEY,
        endpoint_id           UUID        NOT NULL REFERENCES webhook_endpoints (endpoint_id) ON DELETE CASCADE,
        cloud_event_id        UUID        NOT NULL,
        cloud_event_type      TEXT        NOT NULL,
        "timestamp"           TIMESTAMPTZ NOT NULL,
        api_version           TEXT        NOT NULL,
        data                  JSONB       NOT NULL,
        next_delivery_attempt TIMESTAMPTZ NOT NULL,
        attempts              INTEGER     NOT NULL DEFAULT 0,
        status                TEXT        NOT NULL DEFAULT 'pending'
                              CHECK (status IN ('pending', 'delivered', 'dead')),
        last_error            TEXT,
        delivered_at          TIMESTAMPTZ,
        UNIQUE (endpoint_id, cloud_event_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_webhook_messages_due
        ON webhook_messages (next_delivery_attempt)
        WHERE status = 'pending'
    "#,
];

/// Create every table and index this crate uses, if missing.
#[instrument(skip(pool), err)]
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = STATEMENTS.len(), "schema ensured");
    Ok(())
}
