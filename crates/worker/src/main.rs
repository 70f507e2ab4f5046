//! Consumer-group worker: applies product events from the channel to the store.

use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::{info, warn};

use catalog_events::EventChannel;
use catalog_infra::{
    ConsumerWorker, InMemoryProductStore, PostgresProductStore, ProductStore, SyncConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    catalog_observability::init();

    let config = SyncConfig::from_env().context("invalid configuration")?;

    let store: Arc<dyn ProductStore> = match &config.database_url {
        Some(url) => Arc::new(
            PostgresProductStore::connect(url)
                .await
                .context("failed to connect to Postgres")?,
        ),
        None => {
            warn!("DATABASE_URL not set; using in-memory store");
            Arc::new(InMemoryProductStore::new())
        }
    };

    let url = channel_url(&config)?;
    let channel = connect_channel(url, &config).await?;
    run(channel, store, &config).await
}

/// The worker only makes sense against a channel other processes publish to.
fn channel_url(config: &SyncConfig) -> anyhow::Result<&str> {
    let Some(url) = config.redis_url.as_deref() else {
        bail!("REDIS_URL is not set; the sync worker needs a shared channel to consume from");
    };
    Ok(url)
}

#[cfg(feature = "redis")]
async fn connect_channel(
    url: &str,
    config: &SyncConfig,
) -> anyhow::Result<Arc<catalog_infra::channel::RedisStreamsChannel>> {
    let channel = catalog_infra::channel::RedisStreamsChannel::connect(url, config.partitions)
        .await
        .context("failed to connect to Redis")?
        .with_assignment(config.member_index, config.member_count);
    Ok(Arc::new(channel))
}

#[cfg(not(feature = "redis"))]
async fn connect_channel(
    _url: &str,
    _config: &SyncConfig,
) -> anyhow::Result<Arc<catalog_events::InMemoryEventChannel>> {
    bail!("REDIS_URL is set but the worker was built without the `redis` feature")
}

async fn run<C>(
    channel: Arc<C>,
    store: Arc<dyn ProductStore>,
    config: &SyncConfig,
) -> anyhow::Result<()>
where
    C: EventChannel + 'static,
{
    let consumer = ConsumerWorker::spawn(channel, store, config)
        .await
        .context("failed to start consumer group")?;

    info!(
        group = %config.consumer_group,
        consumer = %config.consumer_name,
        partitions = config.partitions,
        dead_letter_topic = ?config.dead_letter_topic,
        "catalog sync worker running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutdown requested");
    consumer.shutdown().await;
    info!("catalog sync worker stopped");
    Ok(())
}
