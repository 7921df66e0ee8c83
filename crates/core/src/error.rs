//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, unknown event
/// names, malformed identifiers). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A persisted event carries a discriminator no variant claims.
    #[error("unknown event name: {0}")]
    UnknownEvent(String),

    /// A persisted payload did not match the schema of its discriminator.
    #[error("malformed payload for {event_name}: {reason}")]
    MalformedPayload { event_name: String, reason: String },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_event(name: impl Into<String>) -> Self {
        Self::UnknownEvent(name.into())
    }

    pub fn malformed(event_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            event_name: event_name.into(),
            reason: reason.into(),
        }
    }
}
