use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Largest page the upstream accepts.
pub const MAX_PAGE_SIZE: u32 = 5000;

/// One page request against the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRequest {
    pub entity_name: String,
    pub columns: Vec<String>,
    pub page_size: u32,
    /// 1-based.
    pub page_number: u32,
    pub paging_cookie: Option<String>,
    /// `None` requests a full initial sync.
    pub data_token: Option<String>,
}

/// A single changed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeItem {
    NewOrUpdated {
        id: String,
        attributes: Map<String, JsonValue>,
    },
    Removed {
        id: String,
    },
}

impl ChangeItem {
    pub fn id(&self) -> &str {
        match self {
            ChangeItem::NewOrUpdated { id, .. } | ChangeItem::Removed { id } => id,
        }
    }
}

/// Raw upstream response for one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangePage {
    pub items: Vec<ChangeItem>,
    pub more_records: bool,
    pub paging_cookie: Option<String>,
    /// Only meaningful on the final page of a pass.
    pub data_token: Option<String>,
}

/// A non-empty page handed to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub entity_name: String,
    pub page_number: u32,
    pub items: Vec<ChangeItem>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// The supplied data token is older than the upstream's retention window.
    #[error("change tracking version expired: {0}")]
    ExpiredVersion(String),

    /// The upstream could not serve the requested page size.
    #[error("upstream resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("upstream request failed: {0}")]
    Other(String),
}

/// Upstream change-tracking API.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn retrieve_changes(&self, request: &ChangeRequest) -> Result<ChangePage, SourceError>;
}

#[async_trait]
impl<S> ChangeSource for Arc<S>
where
    S: ChangeSource + ?Sized,
{
    async fn retrieve_changes(&self, request: &ChangeRequest) -> Result<ChangePage, SourceError> {
        (**self).retrieve_changes(request).await
    }
}
