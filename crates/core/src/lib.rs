//! `courier-core`: identifier and error building blocks.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{EndpointId, EventId, MessageId, OwnerId};
