//! Postgres-backed webhook store.
//!
//! `claim_due` uses `FOR UPDATE SKIP LOCKED` inside a single `UPDATE ...
//! RETURNING`, so concurrent schedulers never claim the same message. The
//! claim pushes `next_delivery_attempt` forward by the lease; a scheduler
//! that dies mid-send leaves the message to be retried once the lease lapses.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use courier_core::{EndpointId, MessageId, OwnerId};
use courier_events::ApiVersion;

use super::store::{WebhookStore, WebhookStoreError};
use super::types::{MessageStatus, WebhookEndpoint, WebhookMessage};

const MESSAGE_COLUMNS: &str = r#"
    message_id, endpoint_id, cloud_event_id, cloud_event_type, "timestamp",
    api_version, data, next_delivery_attempt, attempts, status, last_error, delivered_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresWebhookStore {
    pool: PgPool,
}

impl PostgresWebhookStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a guarded transition touched no rows.
    async fn transition_error(&self, message_id: MessageId, expected: MessageStatus) -> WebhookStoreError {
        let status: Result<Option<String>, _> =
            sqlx::query_scalar("SELECT status FROM webhook_messages WHERE message_id = $1")
                .bind(message_id.as_uuid())
                .fetch_optional(&self.pool)
                .await;
        match status {
            Ok(None) => WebhookStoreError::MessageNotFound(message_id),
            Ok(Some(status)) => match status.parse::<MessageStatus>() {
                Ok(status) => WebhookStoreError::InvalidState {
                    message_id,
                    status,
                    expected,
                },
                Err(e) => WebhookStoreError::Storage(e.to_string()),
            },
            Err(e) => map_sqlx_error("transition_error", e),
        }
    }
}

#[async_trait]
impl WebhookStore for PostgresWebhookStore {
    #[instrument(skip(self), fields(api_version = %api_version), err)]
    async fn subscribed_endpoints(
        &self,
        cloud_event_type: &str,
        api_version: &ApiVersion,
    ) -> Result<Vec<WebhookEndpoint>, WebhookStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT endpoint_id, owner_id, address, api_version, cloud_event_types, enabled
            FROM webhook_endpoints
            WHERE enabled = TRUE
              AND api_version = $1
              AND $2 = ANY(cloud_event_types)
            "#,
        )
        .bind(api_version.as_str())
        .bind(cloud_event_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("subscribed_endpoints", e))?;

        rows.iter().map(endpoint_from_row).collect()
    }

    #[instrument(skip(self), fields(endpoint_id = %endpoint_id), err)]
    async fn endpoint(&self, endpoint_id: EndpointId) -> Result<Option<WebhookEndpoint>, WebhookStoreError> {
        let row = sqlx::query(
            r#"
            SELECT endpoint_id, owner_id, address, api_version, cloud_event_types, enabled
            FROM webhook_endpoints
            WHERE endpoint_id = $1
            "#,
        )
        .bind(endpoint_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("endpoint", e))?;

        row.as_ref().map(endpoint_from_row).transpose()
    }

    #[instrument(
        skip(self, message),
        fields(message_id = %message.message_id, endpoint_id = %message.endpoint_id, cloud_event_id = %message.cloud_event_id),
        err
    )]
    async fn enqueue(&self, message: &WebhookMessage) -> Result<bool, WebhookStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_messages (
                message_id, endpoint_id, cloud_event_id, cloud_event_type, "timestamp",
                api_version, data, next_delivery_attempt, attempts, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (endpoint_id, cloud_event_id) DO NOTHING
            "#,
        )
        .bind(message.message_id.as_uuid())
        .bind(message.endpoint_id.as_uuid())
        .bind(message.cloud_event_id)
        .bind(&message.cloud_event_type)
        .bind(message.timestamp)
        .bind(message.api_version.as_str())
        .bind(&message.data)
        .bind(message.next_delivery_attempt)
        .bind(message.attempts as i32)
        .bind(message.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<WebhookMessage>, WebhookStoreError> {
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::hours(1));
        let sql = format!(
            r#"
            WITH due AS (
                SELECT message_id
                FROM webhook_messages
                WHERE status = 'pending' AND next_delivery_attempt <= $1
                ORDER BY next_delivery_attempt
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE webhook_messages m
            SET next_delivery_attempt = $3
            FROM due
            WHERE m.message_id = due.message_id
            RETURNING {cols}
            "#,
            cols = MESSAGE_COLUMNS
                .split(',')
                .map(|c| format!("m.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(now + lease)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_due", e))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let message: WebhookMessage = MessageRow::from_row(row)
                .map_err(|e| map_sqlx_error("claim_due.decode", e))?
                .try_into()?;
            messages.push(message);
        }
        Ok(messages)
    }

    #[instrument(skip(self), fields(message_id = %message_id), err)]
    async fn renew_lease(
        &self,
        message_id: MessageId,
        claimed_until: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, WebhookStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_messages
            SET next_delivery_attempt = $3
            WHERE message_id = $1 AND status = 'pending' AND next_delivery_attempt = $2
            "#,
        )
        .bind(message_id.as_uuid())
        .bind(claimed_until)
        .bind(until)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_lease", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(message_id = %message_id), err)]
    async fn mark_delivered(&self, message_id: MessageId, at: DateTime<Utc>) -> Result<(), WebhookStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_messages
            SET status = 'delivered', delivered_at = $2
            WHERE message_id = $1 AND status = 'pending'
            "#,
        )
        .bind(message_id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_delivered", e))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(message_id, MessageStatus::Pending).await);
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(message_id = %message_id), err)]
    async fn reschedule(
        &self,
        message_id: MessageId,
        attempts: u32,
        next_attempt: DateTime<Utc>,
        error: &str,
    ) -> Result<(), WebhookStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_messages
            SET attempts = $2, next_delivery_attempt = $3, last_error = $4
            WHERE message_id = $1 AND status = 'pending'
            "#,
        )
        .bind(message_id.as_uuid())
        .bind(attempts as i32)
        .bind(next_attempt)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reschedule", e))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(message_id, MessageStatus::Pending).await);
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(message_id = %message_id), err)]
    async fn mark_dead(&self, message_id: MessageId, attempts: u32, error: &str) -> Result<(), WebhookStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_messages
            SET status = 'dead', attempts = $2, last_error = $3
            WHERE message_id = $1 AND status = 'pending'
            "#,
        )
        .bind(message_id.as_uuid())
        .bind(attempts as i32)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_dead", e))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(message_id, MessageStatus::Pending).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(message_id = %message_id), err)]
    async fn requeue_dead(&self, message_id: MessageId, now: DateTime<Utc>) -> Result<(), WebhookStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_messages
            SET status = 'pending', attempts = 0, next_delivery_attempt = $2
            WHERE message_id = $1 AND status = 'dead'
            "#,
        )
        .bind(message_id.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_dead", e))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(message_id, MessageStatus::Dead).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(message_id = %message_id), err)]
    async fn message(&self, message_id: MessageId) -> Result<Option<WebhookMessage>, WebhookStoreError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM webhook_messages WHERE message_id = $1");
        let row = sqlx::query(&sql)
            .bind(message_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("message", e))?;

        match row {
            Some(row) => Ok(Some(
                MessageRow::from_row(&row)
                    .map_err(|e| map_sqlx_error("message.decode", e))?
                    .try_into()?,
            )),
            None => Ok(None),
        }
    }
}

fn endpoint_from_row(row: &PgRow) -> Result<WebhookEndpoint, WebhookStoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("endpoint.decode", e);
    let types: Vec<String> = row.try_get("cloud_event_types").map_err(decode)?;
    Ok(WebhookEndpoint {
        endpoint_id: EndpointId::from_uuid(row.try_get("endpoint_id").map_err(decode)?),
        owner_id: OwnerId::from_uuid(row.try_get("owner_id").map_err(decode)?),
        address: row.try_get("address").map_err(decode)?,
        api_version: ApiVersion::new(row.try_get::<String, _>("api_version").map_err(decode)?),
        cloud_event_types: types.into_iter().collect(),
        enabled: row.try_get("enabled").map_err(decode)?,
    })
}

#[derive(Debug)]
struct MessageRow {
    message_id: Uuid,
    endpoint_id: Uuid,
    cloud_event_id: Uuid,
    cloud_event_type: String,
    timestamp: DateTime<Utc>,
    api_version: String,
    data: JsonValue,
    next_delivery_attempt: DateTime<Utc>,
    attempts: i32,
    status: String,
    last_error: Option<String>,
    delivered_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for MessageRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            message_id: row.try_get("message_id")?,
            endpoint_id: row.try_get("endpoint_id")?,
            cloud_event_id: row.try_get("cloud_event_id")?,
            cloud_event_type: row.try_get("cloud_event_type")?,
            timestamp: row.try_get("timestamp")?,
            api_version: row.try_get("api_version")?,
            data: row.try_get("data")?,
            next_delivery_attempt: row.try_get("next_delivery_attempt")?,
            attempts: row.try_get("attempts")?,
            status: row.try_get("status")?,
            last_error: row.try_get("last_error")?,
            delivered_at: row.try_get("delivered_at")?,
        })
    }
}

impl TryFrom<MessageRow> for WebhookMessage {
    type Error = WebhookStoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(WebhookMessage {
            message_id: MessageId::from_uuid(row.message_id),
            endpoint_id: EndpointId::from_uuid(row.endpoint_id),
            cloud_event_id: row.cloud_event_id,
            cloud_event_type: row.cloud_event_type,
            timestamp: row.timestamp,
            api_version: ApiVersion::new(row.api_version),
            data: row.data,
            next_delivery_attempt: row.next_delivery_attempt,
            attempts: row.attempts.max(0) as u32,
            status: row
                .status
                .parse()
                .map_err(|e: courier_core::DomainError| WebhookStoreError::Storage(e.to_string()))?,
            last_error: row.last_error,
            delivered_at: row.delivered_at,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> WebhookStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned());
            match code.as_deref() {
                Some("23505") => WebhookStoreError::Storage(format!(
                    "unique violation in {operation}: {}",
                    db_err.message()
                )),
                Some("23503") => WebhookStoreError::Storage(format!(
                    "unknown endpoint in {operation}: {}",
                    db_err.message()
                )),
                _ => WebhookStoreError::Storage(format!(
                    "database error in {operation}: {}",
                    db_err.message()
                )),
            }
        }
        sqlx::Error::PoolClosed => {
            WebhookStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => WebhookStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
