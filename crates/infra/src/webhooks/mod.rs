//! Webhook fan-out and delivery.
//!
//! Notifications produced by the mappers are materialised as one
//! [`WebhookMessage`] per subscribed endpoint. The scheduler delivers due
//! messages as CloudEvents binary-mode POSTs, retrying failures with backoff
//! until a message is delivered or exhausts its attempts.

pub mod dispatcher;
pub mod postgres;
pub mod retry;
pub mod scheduler;
pub mod sender;
pub mod store;
pub mod types;

pub use dispatcher::{DispatchOutcome, WebhookDispatcher, WebhookObserver};
pub use postgres::PostgresWebhookStore;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use scheduler::{SchedulerConfig, TickReport, WebhookScheduler};
pub use sender::{DeliveryError, ReqwestWebhookSender, SenderConfig, WebhookSender};
pub use store::{InMemoryWebhookStore, WebhookStore, WebhookStoreError};
pub use types::{MessageStatus, WebhookEndpoint, WebhookMessage};
