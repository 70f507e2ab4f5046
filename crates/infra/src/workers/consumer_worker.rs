use std::future::poll_fn;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use catalog_events::envelope::HEADER_OCCURRED_AT;
use catalog_events::{
    ChannelError, Delivery, EventChannel, EventEnvelope, OutboundRecord, Subscription,
};
use catalog_products::{EventKind, ProductEvent};

use crate::config::SyncConfig;
use crate::consumer::{ApplyOutcome, ProductConsumer};
use crate::store::ProductStore;

pub const HEADER_DEAD_LETTER_REASON: &str = "dead-letter-reason";
pub const HEADER_SOURCE_TOPIC: &str = "source-topic";
pub const HEADER_SOURCE_PARTITION: &str = "source-partition";
pub const HEADER_SOURCE_OFFSET: &str = "source-offset";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsumeError {
    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: ChannelError,
    },
}

/// Handle to stop the consumer group member.
#[derive(Debug)]
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Request graceful shutdown and wait for the applier task to stop.
    ///
    /// A record being applied when shutdown is requested is finished and committed first;
    /// records read but not yet applied are released.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            error!(error = %err, "consumer task panicked");
        }
    }
}

/// Consumer group member for the four product topics.
///
/// ## Ordering
///
/// Each event kind has its own topic, but a product's events must be applied in
/// publish order whatever their kind (a stock change published after a creation must
/// not be applied before it). One applier task therefore reads all four topics and
/// holds the head record of every assigned partition. It applies the held record with
/// the earliest `occurred-at` header, and only after a full pass over every topic
/// found nothing new, so a record published earlier on another topic is always seen
/// first. The producer appends strictly in publish order, which makes that pass enough.
///
/// ## Delivery
///
/// - Each delivery is applied and its store write awaited before commit
/// - Store failures release the delivery for redelivery after a backoff
/// - Skipped and undecodable events are committed, and forwarded to the dead-letter
///   topic when one is configured
#[derive(Debug)]
pub struct ConsumerWorker;

impl ConsumerWorker {
    /// Join the group on every product topic and start applying.
    pub async fn spawn<C, S>(
        channel: Arc<C>,
        store: S,
        config: &SyncConfig,
    ) -> Result<ConsumerHandle, ConsumeError>
    where
        C: EventChannel + 'static,
        S: ProductStore + 'static,
    {
        // Subscribe everywhere first so a failure leaves nothing running.
        let mut subscriptions = Vec::with_capacity(EventKind::ALL.len());
        for kind in EventKind::ALL {
            let topic = config.topics.topic(kind).to_string();
            let sub = channel
                .subscribe(&topic, &config.consumer_group, &config.consumer_name)
                .await
                .map_err(|source| ConsumeError::Subscribe {
                    topic: topic.clone(),
                    source,
                })?;
            subscriptions.push(sub);
        }

        let applier = Applier {
            channel,
            consumer: ProductConsumer::new(store),
            dead_letter_topic: config.dead_letter_topic.clone(),
            retry_backoff: config.retry_backoff,
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(apply_loop(applier, subscriptions, shutdown_rx));

        info!(
            group = %config.consumer_group,
            consumer = %config.consumer_name,
            "consumer group started"
        );

        Ok(ConsumerHandle {
            shutdown: shutdown_tx,
            join,
        })
    }
}

struct Applier<C, S> {
    channel: Arc<C>,
    consumer: ProductConsumer<S>,
    dead_letter_topic: Option<String>,
    retry_backoff: Duration,
}

/// A delivery read and kept in flight until it is the oldest one held.
struct Held {
    /// Index into `EventKind::ALL` and the subscription list.
    slot: usize,
    delivery: Delivery,
    /// Records without the header sort first, in arrival order.
    occurred_at: Option<DateTime<Utc>>,
    arrival: u64,
}

impl Held {
    fn new(slot: usize, delivery: Delivery, arrival: u64) -> Self {
        let occurred_at = delivery
            .header(HEADER_OCCURRED_AT)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Self {
            slot,
            delivery,
            occurred_at,
            arrival,
        }
    }
}

fn oldest(held: &[Held]) -> Option<usize> {
    held.iter()
        .enumerate()
        .min_by_key(|(_, h)| (h.occurred_at, h.arrival))
        .map(|(i, _)| i)
}

enum Gathered {
    Quiet,
    /// At least one topic could not be read; applying now could break ordering.
    Failed,
}

/// Read every record that is available right now, until a whole pass over the
/// subscriptions finds nothing new.
async fn gather<Sub: Subscription>(
    subs: &mut [Sub],
    held: &mut Vec<Held>,
    arrivals: &mut u64,
) -> Gathered {
    loop {
        let mut fetched = false;
        for (slot, sub) in subs.iter_mut().enumerate() {
            loop {
                match sub.try_next().await {
                    Ok(Some(delivery)) => {
                        held.push(Held::new(slot, delivery, *arrivals));
                        *arrivals += 1;
                        fetched = true;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let kind = EventKind::ALL[slot];
                        error!(%kind, error = %err, "failed to read from channel");
                        return Gathered::Failed;
                    }
                }
            }
        }
        if !fetched {
            return Gathered::Quiet;
        }
    }
}

/// Wait until any subscription yields.
async fn next_from_any<Sub: Subscription>(
    subs: &mut [Sub],
) -> (usize, Result<Option<Delivery>, ChannelError>) {
    let mut waiting: Vec<_> = subs.iter_mut().map(|sub| sub.next()).collect();
    poll_fn(|cx| {
        for (slot, next) in waiting.iter_mut().enumerate() {
            if let Poll::Ready(result) = next.as_mut().poll(cx) {
                return Poll::Ready((slot, result));
            }
        }
        Poll::Pending
    })
    .await
}

async fn apply_loop<C, S>(
    applier: Applier<C, S>,
    mut subs: Vec<C::Subscription>,
    mut shutdown: watch::Receiver<bool>,
) where
    C: EventChannel,
    S: ProductStore,
{
    let mut held: Vec<Held> = Vec::new();
    let mut arrivals = 0u64;

    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Gathered::Failed = gather(&mut subs, &mut held, &mut arrivals).await {
            tokio::time::sleep(applier.retry_backoff).await;
            continue;
        }

        if let Some(i) = oldest(&held) {
            let next = held.swap_remove(i);
            let kind = EventKind::ALL[next.slot];
            applier.process(kind, &mut subs[next.slot], next.delivery).await;
            continue;
        }

        let (slot, next) = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            woke = next_from_any(&mut subs) => woke,
        };
        match next {
            Ok(Some(delivery)) => {
                held.push(Held::new(slot, delivery, arrivals));
                arrivals += 1;
            }
            Ok(None) => break,
            Err(err) => {
                let kind = EventKind::ALL[slot];
                error!(%kind, error = %err, "failed to read from channel");
                tokio::time::sleep(applier.retry_backoff).await;
            }
        }
    }

    for h in held {
        release(&mut subs[h.slot], &h.delivery).await;
    }
    debug!("consumer task stopped");
}

impl<C, S> Applier<C, S>
where
    C: EventChannel,
    S: ProductStore,
{
    async fn process<Sub>(&self, kind: EventKind, sub: &mut Sub, delivery: Delivery)
    where
        Sub: Subscription,
    {
        let envelope = match EventEnvelope::from_delivery(&delivery, |body| {
            ProductEvent::decode(kind, body)
        }) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %err,
                    "undecodable record"
                );
                self.settle_skipped(sub, &delivery, &err.to_string()).await;
                return;
            }
        };

        match self.consumer.apply(envelope.payload()).await {
            Ok(ApplyOutcome::Skipped(reason)) => {
                warn!(
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    event_id = %envelope.event_id(),
                    reason = %reason,
                    "event skipped"
                );
                self.settle_skipped(sub, &delivery, &reason.to_string()).await;
            }
            Ok(outcome) => {
                debug!(
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    event_id = %envelope.event_id(),
                    ?outcome,
                    "event applied"
                );
                commit(sub, &delivery).await;
            }
            Err(err) => {
                error!(
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    event_id = %envelope.event_id(),
                    error = %err,
                    "store write failed, releasing for redelivery"
                );
                release(sub, &delivery).await;
                tokio::time::sleep(self.retry_backoff).await;
            }
        }
    }

    /// Commit a record that will not be applied, forwarding it to the dead-letter topic
    /// first.
    ///
    /// When forwarding fails the record is released instead, so it is not lost.
    async fn settle_skipped<Sub: Subscription>(
        &self,
        sub: &mut Sub,
        delivery: &Delivery,
        reason: &str,
    ) {
        let Some(dlq) = &self.dead_letter_topic else {
            commit(sub, delivery).await;
            return;
        };

        match self.channel.publish(dead_letter_record(dlq, delivery, reason)).await {
            Ok(position) => {
                info!(
                    dead_letter_topic = %position.topic,
                    offset = position.offset,
                    source_topic = %delivery.topic,
                    source_offset = delivery.offset,
                    "record forwarded to dead-letter topic"
                );
                commit(sub, delivery).await;
            }
            Err(err) => {
                error!(dead_letter_topic = %dlq, error = %err, "dead-letter publish failed");
                release(sub, delivery).await;
                tokio::time::sleep(self.retry_backoff).await;
            }
        }
    }
}

fn dead_letter_record(topic: &str, delivery: &Delivery, reason: &str) -> OutboundRecord {
    let mut record = OutboundRecord::new(topic, delivery.payload.clone());
    record.headers = delivery.headers.clone();
    record.key = delivery.key.clone();
    record
        .with_header(HEADER_DEAD_LETTER_REASON, reason)
        .with_header(HEADER_SOURCE_TOPIC, delivery.topic.clone())
        .with_header(HEADER_SOURCE_PARTITION, delivery.partition.to_string())
        .with_header(HEADER_SOURCE_OFFSET, delivery.offset.to_string())
}

async fn commit<Sub: Subscription>(sub: &mut Sub, delivery: &Delivery) {
    if let Err(err) = sub.commit(delivery).await {
        warn!(
            topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            error = %err,
            "commit failed; record will be redelivered"
        );
    }
}

async fn release<Sub: Subscription>(sub: &mut Sub, delivery: &Delivery) {
    if let Err(err) = sub.release(delivery).await {
        warn!(
            topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            error = %err,
            "release failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use catalog_core::ProductId;
    use catalog_events::InMemoryEventChannel;
    use catalog_products::Product;

    use super::*;
    use crate::store::{InMemoryProductStore, StoreError};

    /// Store whose first `failures` upserts fail.
    struct FlakyStore {
        inner: InMemoryProductStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl ProductStore for FlakyStore {
        async fn find_all(&self) -> Result<Vec<Product>, StoreError> {
            self.inner.find_all().await
        }

        async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
            self.inner.find_by_id(id).await
        }

        async fn upsert(&self, product: Product) -> Result<(), StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Backend("connection reset".to_string()));
            }
            self.inner.upsert(product).await
        }

        async fn delete_by_id(&self, id: ProductId) -> Result<bool, StoreError> {
            self.inner.delete_by_id(id).await
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            retry_backoff: Duration::from_millis(5),
            consumer_name: "test".to_string(),
            ..SyncConfig::default()
        }
    }

    async fn publish(channel: &InMemoryEventChannel, topic: &str, key: &str, body: &str) {
        channel
            .publish(OutboundRecord::new(topic, body).with_key(key))
            .await
            .unwrap();
    }

    async fn wait_committed(channel: &InMemoryEventChannel, topic: &str, total: u64) {
        for _ in 0..200 {
            let committed: u64 = channel.committed(topic, "product-group").iter().sum();
            if committed >= total {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{topic} never reached {total} committed records");
    }

    #[tokio::test]
    async fn failed_write_is_retried_until_it_lands() {
        let channel = Arc::new(InMemoryEventChannel::new());
        let store = Arc::new(FlakyStore {
            inner: InMemoryProductStore::new(),
            failures: AtomicUsize::new(2),
        });

        let handle = ConsumerWorker::spawn(channel.clone(), store.clone(), &config())
            .await
            .unwrap();
        publish(
            &channel,
            "product-created",
            "1",
            r#"{"id":1,"name":"A","description":"d","price":10.0,"stock":5}"#,
        )
        .await;

        wait_committed(&channel, "product-created", 1).await;
        handle.shutdown().await;

        assert_eq!(store.failures.load(Ordering::SeqCst), 0);
        assert!(store.inner.find_by_id(ProductId::new(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn undecodable_and_skipped_records_go_to_dead_letter_topic() {
        let channel = Arc::new(InMemoryEventChannel::new());
        let store = Arc::new(InMemoryProductStore::new());
        let cfg = SyncConfig {
            dead_letter_topic: Some("product-dlq".to_string()),
            ..config()
        };

        let handle = ConsumerWorker::spawn(channel.clone(), store.clone(), &cfg)
            .await
            .unwrap();
        publish(&channel, "product-updated", "5", "not json").await;
        publish(&channel, "product-stock-updated", "99", r#"{"id":99,"stock":3}"#).await;

        wait_committed(&channel, "product-updated", 1).await;
        wait_committed(&channel, "product-stock-updated", 1).await;
        handle.shutdown().await;

        let dead = channel.records("product-dlq");
        assert_eq!(dead.len(), 2);
        assert!(dead.iter().all(|d| d.header(HEADER_DEAD_LETTER_REASON).is_some()));
        let sources: Vec<_> = dead
            .iter()
            .filter_map(|d| d.header(HEADER_SOURCE_TOPIC))
            .collect();
        assert!(sources.contains(&"product-updated"));
        assert!(sources.contains(&"product-stock-updated"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn changes_are_applied_in_publish_order_across_topics() {
        let channel = Arc::new(InMemoryEventChannel::new());
        let store = Arc::new(InMemoryProductStore::new());

        // Both are waiting when the worker starts; only the timestamps tell their order.
        channel
            .publish(
                OutboundRecord::new("product-stock-updated", r#"{"id":1,"stock":2}"#)
                    .with_key("1")
                    .with_header(HEADER_OCCURRED_AT, "2024-05-01T10:00:01Z"),
            )
            .await
            .unwrap();
        channel
            .publish(
                OutboundRecord::new(
                    "product-created",
                    r#"{"id":1,"name":"A","description":"d","price":10.0,"stock":5}"#,
                )
                .with_key("1")
                .with_header(HEADER_OCCURRED_AT, "2024-05-01T10:00:00Z"),
            )
            .await
            .unwrap();

        let handle = ConsumerWorker::spawn(channel.clone(), store.clone(), &config())
            .await
            .unwrap();
        wait_committed(&channel, "product-created", 1).await;
        wait_committed(&channel, "product-stock-updated", 1).await;
        handle.shutdown().await;

        let stored = store.find_by_id(ProductId::new(1)).await.unwrap().unwrap();
        assert_eq!(stored.stock, 2);
    }

    #[tokio::test]
    async fn invalid_wire_event_is_dead_lettered_not_stored() {
        let channel = Arc::new(InMemoryEventChannel::new());
        let store = Arc::new(InMemoryProductStore::new());
        let cfg = SyncConfig {
            dead_letter_topic: Some("product-dlq".to_string()),
            ..config()
        };

        let handle = ConsumerWorker::spawn(channel.clone(), store.clone(), &cfg)
            .await
            .unwrap();
        publish(
            &channel,
            "product-created",
            "1",
            r#"{"id":1,"name":"A","description":"d","price":10.0,"stock":-7}"#,
        )
        .await;

        wait_committed(&channel, "product-created", 1).await;
        handle.shutdown().await;

        assert_eq!(store.find_by_id(ProductId::new(1)).await.unwrap(), None);
        let dead = channel.records("product-dlq");
        assert_eq!(dead.len(), 1);
        assert!(dead[0].header(HEADER_DEAD_LETTER_REASON).unwrap().contains("stock"));
    }

    #[tokio::test]
    async fn skipped_records_are_committed_without_dead_letter_topic() {
        let channel = Arc::new(InMemoryEventChannel::new());
        let store = Arc::new(InMemoryProductStore::new());

        let handle = ConsumerWorker::spawn(channel.clone(), store.clone(), &config())
            .await
            .unwrap();
        publish(&channel, "product-stock-updated", "99", r#"{"id":99,"stock":3}"#).await;

        wait_committed(&channel, "product-stock-updated", 1).await;
        handle.shutdown().await;

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn subscribe_failure_is_reported() {
        let channel = Arc::new(InMemoryEventChannel::new());
        channel.close();

        let err = ConsumerWorker::spawn(channel, InMemoryProductStore::new(), &config())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumeError::Subscribe { .. }));
    }
}
