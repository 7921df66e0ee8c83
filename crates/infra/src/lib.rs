//! Infrastructure for the courier pipeline: change pulling, the transactional
//! outbox, and webhook delivery, each with in-memory and Postgres backends.

pub mod changes;
pub mod config;
pub mod lock;
pub mod outbox;
pub mod schema;
pub mod webhooks;

pub use config::{ConfigError, CourierConfig};
pub use schema::ensure_schema;
