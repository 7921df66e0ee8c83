use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use courier_events::MapperRegistry;
use courier_infra::outbox::{OutboxPublisher, PostgresOutboxStore};
use courier_infra::webhooks::{PostgresWebhookStore, ReqwestWebhookSender, WebhookObserver, WebhookScheduler};
use courier_infra::{CourierConfig, ensure_schema};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let config = CourierConfig::from_env().context("loading configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("connecting to Postgres")?;
    ensure_schema(&pool).await.context("bootstrapping schema")?;

    let webhooks = Arc::new(PostgresWebhookStore::new(pool.clone()));
    let publisher = OutboxPublisher::new(PostgresOutboxStore::new(pool.clone()), config.publisher.clone())
        .with_observer(WebhookObserver::new(MapperRegistry::standard(), webhooks.clone()));

    let sender = ReqwestWebhookSender::new(config.sender.clone()).context("building webhook client")?;
    let scheduler = WebhookScheduler::new(webhooks, Arc::new(sender), config.scheduler.clone());

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("shutdown requested"),
                Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c; shutting down"),
            }
            cancel.cancel();
        }
    });

    tracing::info!(
        publish_interval_secs = config.publish_interval.as_secs(),
        scheduler_interval_secs = config.scheduler.poll_interval.as_secs(),
        "courier worker started"
    );

    tokio::join!(
        publisher.run(config.publish_interval, cancel.clone()),
        scheduler.run(cancel.clone()),
    );

    pool.close().await;
    tracing::info!("courier worker stopped");
    Ok(())
}
