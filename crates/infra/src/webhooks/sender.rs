//! CloudEvents binary-mode HTTP delivery.
//!
//! Event attributes travel as `ce-*` headers; the body is exactly the
//! notification data with no outer envelope.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tracing::{debug, instrument};

use courier_events::ApiVersion;

use super::types::{WebhookEndpoint, WebhookMessage};

pub const CLOUD_EVENTS_SPEC_VERSION: &str = "1.0";
pub const USER_AGENT: &str = "courier-webhooks/1.0";

pub const CE_SPECVERSION: HeaderName = HeaderName::from_static("ce-specversion");
pub const CE_ID: HeaderName = HeaderName::from_static("ce-id");
pub const CE_SOURCE: HeaderName = HeaderName::from_static("ce-source");
pub const CE_TYPE: HeaderName = HeaderName::from_static("ce-type");
pub const CE_TIME: HeaderName = HeaderName::from_static("ce-time");
pub const CE_DATASCHEMA: HeaderName = HeaderName::from_static("ce-dataschema");

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("endpoint responded with HTTP {status}")]
    Status { status: u16 },

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid {header} header value: {reason}")]
    InvalidHeader { header: &'static str, reason: String },

    #[error("failed to encode body: {0}")]
    Body(String),

    #[error("failed to build http client: {0}")]
    Client(String),

    #[error("delivery cancelled")]
    Cancelled,
}

impl DeliveryError {
    /// Cancellation is not a delivery failure and consumes no attempt.
    pub fn counts_as_attempt(&self) -> bool {
        !matches!(self, DeliveryError::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// `ce-source` for every delivery.
    pub source: String,
    /// Base of `ce-dataschema`; `{base}/{api_version}/{type}.json`.
    pub schema_base: String,
    pub timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            source: "https://courier.local".to_string(),
            schema_base: "https://courier.local/schemas".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send(&self, endpoint: &WebhookEndpoint, message: &WebhookMessage) -> Result<(), DeliveryError>;
}

#[async_trait]
impl<T> WebhookSender for Arc<T>
where
    T: WebhookSender + ?Sized,
{
    async fn send(&self, endpoint: &WebhookEndpoint, message: &WebhookMessage) -> Result<(), DeliveryError> {
        (**self).send(endpoint, message).await
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestWebhookSender {
    client: reqwest::Client,
    config: SenderConfig,
}

impl ReqwestWebhookSender {
    pub fn new(config: SenderConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            // Subscribers must answer at the registered address.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DeliveryError::Client(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn dataschema(&self, api_version: &ApiVersion, cloud_event_type: &str) -> String {
        format!(
            "{}/{}/{}.json",
            self.config.schema_base.trim_end_matches('/'),
            api_version,
            cloud_event_type
        )
    }

    pub fn headers(&self, message: &WebhookMessage) -> Result<HeaderMap, DeliveryError> {
        fn value(header: &'static str, raw: &str) -> Result<HeaderValue, DeliveryError> {
            HeaderValue::from_str(raw).map_err(|e| DeliveryError::InvalidHeader {
                header,
                reason: e.to_string(),
            })
        }

        let mut headers = HeaderMap::with_capacity(7);
        headers.insert(CE_SPECVERSION, HeaderValue::from_static(CLOUD_EVENTS_SPEC_VERSION));
        headers.insert(CE_ID, value("ce-id", &message.cloud_event_id.to_string())?);
        headers.insert(CE_SOURCE, value("ce-source", &self.config.source)?);
        headers.insert(CE_TYPE, value("ce-type", &message.cloud_event_type)?);
        headers.insert(
            CE_TIME,
            value("ce-time", &message.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true))?,
        );
        headers.insert(
            CE_DATASCHEMA,
            value(
                "ce-dataschema",
                &self.dataschema(&message.api_version, &message.cloud_event_type),
            )?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

#[async_trait]
impl WebhookSender for ReqwestWebhookSender {
    #[instrument(
        skip(self, endpoint, message),
        fields(endpoint_id = %endpoint.endpoint_id, message_id = %message.message_id, cloud_event_type = %message.cloud_event_type),
        err
    )]
    async fn send(&self, endpoint: &WebhookEndpoint, message: &WebhookMessage) -> Result<(), DeliveryError> {
        let headers = self.headers(message)?;
        let body = serde_json::to_vec(&message.data).map_err(|e| DeliveryError::Body(e.to_string()))?;

        let response = self
            .client
            .post(&endpoint.address)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout
                } else if e.is_connect() {
                    DeliveryError::Connect(e.to_string())
                } else {
                    DeliveryError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status {
                status: status.as_u16(),
            });
        }

        debug!(status = status.as_u16(), "webhook delivered");
        Ok(())
    }
}
