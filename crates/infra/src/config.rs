//! Environment-driven configuration.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::outbox::PublisherConfig;
use crate::webhooks::{RetryPolicy, SchedulerConfig, SenderConfig};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct CourierConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub publish_interval: Duration,
    pub publisher: PublisherConfig,
    pub scheduler: SchedulerConfig,
    pub sender: SenderConfig,
}

impl CourierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let database_url = env
            .string("DATABASE_URL")
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let publisher = PublisherConfig::default()
            .with_batch_size(env.positive("COURIER_PUBLISH_BATCH_SIZE", 10)?)
            .with_strict_drain(env.parse("COURIER_PUBLISH_STRICT_DRAIN", false)?);

        let sender_defaults = SenderConfig::default();
        let sender = SenderConfig {
            source: env.string("COURIER_WEBHOOK_SOURCE").unwrap_or(sender_defaults.source),
            schema_base: env
                .string("COURIER_WEBHOOK_SCHEMA_BASE")
                .unwrap_or(sender_defaults.schema_base),
            timeout: env.secs("COURIER_HTTP_TIMEOUT_SECS", 10)?,
        };

        let retry_base = env.secs("COURIER_RETRY_BASE_SECS", 30)?;
        let retry_max = env.secs("COURIER_RETRY_MAX_SECS", 21_600)?;
        if retry_max < retry_base {
            return Err(ConfigError::Invalid {
                var: "COURIER_RETRY_MAX_SECS",
                reason: "must be at least COURIER_RETRY_BASE_SECS".into(),
            });
        }
        let retry = RetryPolicy::exponential(
            env.positive("COURIER_RETRY_MAX_ATTEMPTS", 8)?,
            retry_base,
            retry_max,
        );

        let scheduler = SchedulerConfig {
            poll_interval: env.secs("COURIER_SCHEDULER_INTERVAL_SECS", 5)?,
            batch_size: env.positive("COURIER_SCHEDULER_BATCH_SIZE", 100)?,
            per_endpoint_concurrency: env.positive("COURIER_ENDPOINT_CONCURRENCY", 2)?,
            retry,
            ..SchedulerConfig::default()
        };

        Ok(Self {
            database_url,
            database_max_connections: env.positive("COURIER_DB_MAX_CONNECTIONS", 10)?,
            publish_interval: env.secs("COURIER_PUBLISH_INTERVAL_SECS", 60)?,
            publisher,
            scheduler,
            sender,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(var) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
            }),
        }
    }

    fn positive<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default,
        T::Err: std::fmt::Display,
    {
        let value = self.parse(var, default)?;
        if value <= T::default() {
            return Err(ConfigError::Invalid {
                var,
                reason: "must be greater than zero".into(),
            });
        }
        Ok(value)
    }

    fn secs(&self, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.positive(var, default).map(Duration::from_secs)
    }
}
