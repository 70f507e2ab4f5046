//! Redis Streams-backed event channel (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream per partition**: `{prefix}:{topic}:{partition}`
//! - **Fields**: `payload`, optional `key`, and one `h:{name}` field per header
//! - **Consumer groups**: `XGROUP CREATE ... 0 MKSTREAM` on subscribe, so a new group
//!   reads each partition from the beginning
//! - **Delivery**: `XREADGROUP` one entry per free partition; `XACK` on commit
//! - **Redelivery**: a released (or never acknowledged) entry stays in the member's
//!   pending list and is read again with id `0` before any new entry
//! - **Takeover**: on subscribe, entries left pending by any other consumer name on an
//!   owned partition (a crashed or renamed earlier instance) are `XCLAIM`ed, so they
//!   are redelivered here
//!
//! Redis balances entries, not partitions, between the consumers of a group. Serial
//! consumption of a partition is kept by static assignment: member `index` of `count`
//! reads partitions `p` with `p % count == index`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingId, StreamReadOptions,
    StreamReadReply,
};
use tracing::{debug, info, instrument, warn};

use catalog_events::{
    ChannelError, Delivery, EventChannel, Headers, OutboundRecord, RecordPosition, Subscription,
    key_partition,
};

const DEFAULT_PREFIX: &str = "catalog";
const DEFAULT_BLOCK_MS: usize = 1_000;
/// Pending entries inspected per `XPENDING` page when taking over a partition.
const CLAIM_PAGE: usize = 100;

const FIELD_PAYLOAD: &str = "payload";
const FIELD_KEY: &str = "key";
const HEADER_FIELD_PREFIX: &str = "h:";

/// Bits of a packed offset holding the entry id's sequence part.
const SEQ_BITS: u32 = 20;

fn backend(err: redis::RedisError) -> ChannelError {
    ChannelError::Backend(err.to_string())
}

#[derive(Clone)]
pub struct RedisStreamsChannel {
    client: Arc<redis::Client>,
    conn: MultiplexedConnection,
    prefix: String,
    partitions: u32,
    member_index: u32,
    member_count: u32,
    block_ms: usize,
    round_robin: Arc<AtomicU32>,
}

impl RedisStreamsChannel {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str, partitions: u32) -> Result<Self, ChannelError> {
        let client = redis::Client::open(redis_url).map_err(backend)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(backend)?;

        Ok(Self {
            client: Arc::new(client),
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
            partitions: partitions.max(1),
            member_index: 0,
            member_count: 1,
            block_ms: DEFAULT_BLOCK_MS,
            round_robin: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Read only the partitions assigned to member `index` out of `count`.
    pub fn with_assignment(mut self, index: u32, count: u32) -> Self {
        self.member_count = count.max(1);
        self.member_index = index % self.member_count;
        self
    }

    fn stream_key(&self, topic: &str, partition: u32) -> String {
        format!("{}:{}:{}", self.prefix, topic, partition)
    }

    fn owned_partitions(&self) -> Vec<u32> {
        (0..self.partitions)
            .filter(|p| p % self.member_count == self.member_index)
            .collect()
    }
}

/// Pack a stream entry id (`{ms}-{seq}`) into a single offset.
fn offset_from_entry_id(id: &str) -> Option<u64> {
    let (ms, seq) = id.split_once('-')?;
    let ms: u64 = ms.parse().ok()?;
    let seq: u64 = seq.parse().ok()?;
    if seq >= 1 << SEQ_BITS {
        return None;
    }
    Some((ms << SEQ_BITS) | seq)
}

fn entry_id_from_offset(offset: u64) -> String {
    format!("{}-{}", offset >> SEQ_BITS, offset & ((1 << SEQ_BITS) - 1))
}

/// Pending entries held by consumer names other than `consumer`.
fn orphaned(pending: &[StreamPendingId], consumer: &str) -> Vec<String> {
    pending
        .iter()
        .filter(|p| p.consumer != consumer)
        .map(|p| p.id.clone())
        .collect()
}

/// Move every entry of `stream` pending under another consumer name to `consumer`.
///
/// Partitions are statically assigned, so on an owned stream such entries can only
/// belong to an earlier instance of this member.
async fn claim_orphaned(
    conn: &mut MultiplexedConnection,
    stream: &str,
    group: &str,
    consumer: &str,
) -> Result<usize, ChannelError> {
    let mut claimed = 0;
    let mut start = "-".to_string();
    loop {
        let page: StreamPendingCountReply = conn
            .xpending_count(stream, group, &start, "+", CLAIM_PAGE)
            .await
            .map_err(backend)?;
        let ids = orphaned(&page.ids, consumer);
        if !ids.is_empty() {
            let _: StreamClaimReply = conn
                .xclaim(stream, group, consumer, 0, ids.as_slice())
                .await
                .map_err(backend)?;
            claimed += ids.len();
        }

        match page.ids.last() {
            Some(last) if page.ids.len() == CLAIM_PAGE => start = format!("({}", last.id),
            _ => return Ok(claimed),
        }
    }
}

#[async_trait]
impl EventChannel for RedisStreamsChannel {
    type Subscription = RedisStreamsSubscription;

    #[instrument(skip(self, record), fields(topic = %record.topic, key = ?record.key), err)]
    async fn publish(&self, record: OutboundRecord) -> Result<RecordPosition, ChannelError> {
        let partition = match &record.key {
            Some(key) => key_partition(key, self.partitions),
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % self.partitions,
        };
        let stream = self.stream_key(&record.topic, partition);

        let mut fields: Vec<(String, String)> = Vec::with_capacity(record.headers.len() + 2);
        fields.push((FIELD_PAYLOAD.to_string(), record.payload));
        if let Some(key) = record.key {
            fields.push((FIELD_KEY.to_string(), key));
        }
        for (name, value) in record.headers {
            fields.push((format!("{HEADER_FIELD_PREFIX}{name}"), value));
        }

        let mut conn = self.conn.clone();
        let id: String = conn.xadd(&stream, "*", fields.as_slice()).await.map_err(backend)?;
        let offset = offset_from_entry_id(&id)
            .ok_or_else(|| ChannelError::Backend(format!("unexpected stream entry id {id}")))?;

        Ok(RecordPosition {
            topic: record.topic,
            partition,
            offset,
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Self::Subscription, ChannelError> {
        let mut conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(backend)?;

        let mut streams = HashMap::new();
        for partition in self.owned_partitions() {
            let key = self.stream_key(topic, partition);
            let created: redis::RedisResult<()> =
                conn.xgroup_create_mkstream(&key, group, "0").await;
            match created {
                Ok(()) => debug!(stream = %key, group, "consumer group created"),
                Err(err) if err.code() == Some("BUSYGROUP") => {}
                Err(err) => return Err(backend(err)),
            }
            let claimed = claim_orphaned(&mut conn, &key, group, consumer).await?;
            if claimed > 0 {
                info!(stream = %key, group, consumer, claimed, "took over pending entries");
            }
            streams.insert(key, partition);
        }

        debug!(topic, group, consumer, partitions = streams.len(), "joined consumer group");

        Ok(RedisStreamsSubscription {
            conn,
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            streams,
            in_flight: HashMap::new(),
            ready: VecDeque::new(),
            block_ms: self.block_ms,
        })
    }
}

/// A group member's subscription to the partition streams of one topic.
///
/// Uses its own connection, since `XREADGROUP ... BLOCK` holds it while waiting.
pub struct RedisStreamsSubscription {
    conn: MultiplexedConnection,
    topic: String,
    group: String,
    consumer: String,
    /// Stream key -> partition, for owned partitions only.
    streams: HashMap<String, u32>,
    /// Partition -> offset handed out and not yet settled.
    in_flight: HashMap<u32, u64>,
    /// Entries read but not yet handed out.
    ready: VecDeque<Delivery>,
    block_ms: usize,
}

impl RedisStreamsSubscription {
    fn free_streams(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .streams
            .iter()
            .filter(|(_, p)| !self.in_flight.contains_key(p))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// `XREADGROUP` from every free partition starting at `from` (`0` = own pending,
    /// `>` = new entries). Read entries become in flight.
    async fn read(&mut self, from: &str, block: bool) -> Result<(), ChannelError> {
        let keys = self.free_streams();
        if keys.is_empty() {
            return Ok(());
        }
        let ids = vec![from; keys.len()];

        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1);
        if block {
            opts = opts.block(self.block_ms);
        }

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(keys.as_slice(), ids.as_slice(), &opts)
            .await
            .map_err(backend)?;

        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            let Some(&partition) = self.streams.get(&stream.key) else {
                continue;
            };
            let Some(entry) = stream.ids.into_iter().next() else {
                continue;
            };
            match self.to_delivery(partition, entry) {
                Some(delivery) => {
                    self.in_flight.insert(partition, delivery.offset);
                    self.ready.push_back(delivery);
                }
                None => warn!(stream = %stream.key, "malformed stream entry ignored"),
            }
        }
        Ok(())
    }

    fn to_delivery(&self, partition: u32, entry: StreamId) -> Option<Delivery> {
        let offset = offset_from_entry_id(&entry.id)?;
        let payload: String = entry.get(FIELD_PAYLOAD)?;
        let key: Option<String> = entry.get(FIELD_KEY);

        let mut headers = Headers::new();
        for name in entry.map.keys() {
            if let Some(header) = name.strip_prefix(HEADER_FIELD_PREFIX) {
                if let Some(value) = entry.get::<String>(name) {
                    headers.insert(header.to_string(), value);
                }
            }
        }

        Some(Delivery {
            topic: self.topic.clone(),
            partition,
            offset,
            key,
            headers,
            payload,
        })
    }

    fn settle(&mut self, delivery: &Delivery) -> Result<String, ChannelError> {
        if delivery.topic != self.topic
            || self.in_flight.get(&delivery.partition) != Some(&delivery.offset)
        {
            return Err(ChannelError::StaleDelivery {
                topic: delivery.topic.clone(),
                partition: delivery.partition,
                offset: delivery.offset,
            });
        }
        self.in_flight.remove(&delivery.partition);

        self.streams
            .iter()
            .find(|(_, p)| **p == delivery.partition)
            .map(|(k, _)| k.clone())
            .ok_or_else(|| ChannelError::Backend("partition not owned".to_string()))
    }
}

#[async_trait]
impl Subscription for RedisStreamsSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, ChannelError> {
        loop {
            if let Some(delivery) = self.ready.pop_front() {
                return Ok(Some(delivery));
            }
            if self.free_streams().is_empty() {
                // Every owned partition has a record out; wait for a commit or release.
                tokio::time::sleep(Duration::from_millis(self.block_ms as u64)).await;
                continue;
            }

            // Own pending entries (released or unacknowledged before a restart) first.
            self.read("0", false).await?;
            if !self.ready.is_empty() {
                continue;
            }
            self.read(">", true).await?;
        }
    }

    async fn try_next(&mut self) -> Result<Option<Delivery>, ChannelError> {
        if self.ready.is_empty() && !self.free_streams().is_empty() {
            self.read("0", false).await?;
            if self.ready.is_empty() {
                self.read(">", false).await?;
            }
        }
        Ok(self.ready.pop_front())
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<(), ChannelError> {
        let stream = self.settle(delivery)?;
        let id = entry_id_from_offset(delivery.offset);
        let _: i64 = self
            .conn
            .xack(&stream, &self.group, std::slice::from_ref(&id))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn release(&mut self, delivery: &Delivery) -> Result<(), ChannelError> {
        // The entry stays pending; the next read with id `0` returns it.
        self.settle(delivery).map(|_| ())
    }
}
