//! In-memory partitioned event channel for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::channel::{
    ChannelError, Delivery, EventChannel, Headers, OutboundRecord, RecordPosition, Subscription,
    key_partition,
};

/// Partitions per topic unless configured otherwise.
pub const DEFAULT_PARTITIONS: u32 = 4;

/// In-memory message log.
///
/// - Topics are created on first use, each with the same partition count
/// - Keyed records are hashed onto a partition; unkeyed records are spread round-robin
/// - Consumer groups track one committed offset per partition
/// - Group members split partitions (`partition % member_count`)
/// - At most one record per partition is in flight for a group
///
/// Cloning is cheap; clones share the same log.
#[derive(Debug, Clone)]
pub struct InMemoryEventChannel {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    partitions: u32,
    state: Mutex<State>,
    /// Bumped on every state change that may unblock a waiting subscriber.
    changed: watch::Sender<u64>,
    next_member: AtomicU64,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, TopicLog>,
    closed: bool,
}

#[derive(Debug)]
struct TopicLog {
    partitions: Vec<Vec<StoredRecord>>,
    groups: HashMap<String, GroupState>,
    round_robin: u32,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    headers: Headers,
    payload: String,
}

#[derive(Debug)]
struct GroupState {
    members: Vec<u64>,
    committed: Vec<u64>,
    in_flight: Vec<Option<InFlight>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlight {
    offset: u64,
    member: u64,
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions).map(|_| Vec::new()).collect(),
            groups: HashMap::new(),
            round_robin: 0,
        }
    }
}

impl GroupState {
    fn new(partitions: usize) -> Self {
        Self {
            members: Vec::new(),
            committed: vec![0; partitions],
            in_flight: vec![None; partitions],
        }
    }

    fn owner(&self, partition: usize) -> Option<u64> {
        if self.members.is_empty() {
            return None;
        }
        self.members.get(partition % self.members.len()).copied()
    }
}

impl InMemoryEventChannel {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: u32) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                partitions: partitions.max(1),
                state: Mutex::new(State::default()),
                changed,
                next_member: AtomicU64::new(1),
            }),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.shared.partitions
    }

    /// Partition a key is routed to.
    pub fn partition_for(&self, key: &str) -> u32 {
        key_partition(key, self.shared.partitions)
    }

    /// Stop accepting records and wake every subscriber (they observe end-of-stream).
    pub fn close(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.closed = true;
        }
        self.shared.notify();
    }

    /// Every record of `topic`, partition by partition, in offset order.
    pub fn records(&self, topic: &str) -> Vec<Delivery> {
        let Ok(state) = self.shared.state.lock() else {
            return vec![];
        };
        let Some(log) = state.topics.get(topic) else {
            return vec![];
        };

        log.partitions
            .iter()
            .enumerate()
            .flat_map(|(p, records)| {
                records.iter().enumerate().map(move |(offset, r)| Delivery {
                    topic: topic.to_string(),
                    partition: p as u32,
                    offset: offset as u64,
                    key: r.key.clone(),
                    headers: r.headers.clone(),
                    payload: r.payload.clone(),
                })
            })
            .collect()
    }

    /// Committed offset per partition for a group (empty when the group is unknown).
    pub fn committed(&self, topic: &str, group: &str) -> Vec<u64> {
        self.shared
            .state
            .lock()
            .ok()
            .and_then(|state| {
                state
                    .topics
                    .get(topic)
                    .and_then(|log| log.groups.get(group))
                    .map(|g| g.committed.clone())
            })
            .unwrap_or_default()
    }
}

impl Default for InMemoryEventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, State>, ChannelError> {
        self.state.lock().map_err(|_| ChannelError::Poisoned)
    }

    fn notify(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }
}

#[async_trait]
impl EventChannel for InMemoryEventChannel {
    type Subscription = InMemorySubscription;

    async fn publish(&self, record: OutboundRecord) -> Result<RecordPosition, ChannelError> {
        let position = {
            let mut state = self.shared.lock()?;
            if state.closed {
                return Err(ChannelError::Closed);
            }

            let partition = match &record.key {
                Some(key) => self.partition_for(key),
                None => {
                    let log = state
                        .topics
                        .entry(record.topic.clone())
                        .or_insert_with(|| TopicLog::new(self.shared.partitions));
                    let p = log.round_robin % self.shared.partitions;
                    log.round_robin = log.round_robin.wrapping_add(1);
                    p
                }
            };

            let log = state
                .topics
                .entry(record.topic.clone())
                .or_insert_with(|| TopicLog::new(self.shared.partitions));
            let records = &mut log.partitions[partition as usize];
            records.push(StoredRecord {
                key: record.key,
                headers: record.headers,
                payload: record.payload,
            });

            RecordPosition {
                topic: record.topic,
                partition,
                offset: (records.len() - 1) as u64,
            }
        };

        debug!(
            topic = %position.topic,
            partition = position.partition,
            offset = position.offset,
            "record appended"
        );
        self.shared.notify();
        Ok(position)
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Self::Subscription, ChannelError> {
        let member = self.shared.next_member.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.shared.lock()?;
            if state.closed {
                return Err(ChannelError::Closed);
            }
            let partitions = self.shared.partitions;
            let log = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicLog::new(partitions));
            let group_state = log
                .groups
                .entry(group.to_string())
                .or_insert_with(|| GroupState::new(partitions as usize));
            group_state.members.push(member);
        }

        debug!(topic, group, consumer, member, "joined consumer group");
        // Membership changed: partitions were reassigned.
        self.shared.notify();

        Ok(InMemorySubscription {
            shared: self.shared.clone(),
            changes: self.shared.changed.subscribe(),
            topic: topic.to_string(),
            group: group.to_string(),
            member,
            cursor: 0,
        })
    }
}

/// A group member's subscription to one topic of an [`InMemoryEventChannel`].
///
/// Dropping it leaves the group; its in-flight records become deliverable to the
/// remaining members.
#[derive(Debug)]
pub struct InMemorySubscription {
    shared: Arc<Shared>,
    changes: watch::Receiver<u64>,
    topic: String,
    group: String,
    member: u64,
    /// Partition to look at first, so busy partitions cannot starve the others.
    cursor: usize,
}

impl InMemorySubscription {
    fn take_next(&mut self, state: &mut State) -> Option<Delivery> {
        let log = state.topics.get_mut(&self.topic)?;
        let partitions = log.partitions.len();
        let group = log.groups.get_mut(&self.group)?;

        for step in 0..partitions {
            let p = (self.cursor + step) % partitions;
            if group.owner(p) != Some(self.member) || group.in_flight[p].is_some() {
                continue;
            }

            let offset = group.committed[p];
            let Some(record) = log.partitions[p].get(offset as usize) else {
                continue;
            };

            group.in_flight[p] = Some(InFlight {
                offset,
                member: self.member,
            });
            self.cursor = (p + 1) % partitions;

            return Some(Delivery {
                topic: self.topic.clone(),
                partition: p as u32,
                offset,
                key: record.key.clone(),
                headers: record.headers.clone(),
                payload: record.payload.clone(),
            });
        }

        None
    }

    /// Finish the in-flight record described by `delivery`; `commit` decides whether the
    /// group's position moves past it.
    fn settle(&self, delivery: &Delivery, commit: bool) -> Result<(), ChannelError> {
        let stale = || ChannelError::StaleDelivery {
            topic: delivery.topic.clone(),
            partition: delivery.partition,
            offset: delivery.offset,
        };

        {
            let mut state = self.shared.lock()?;
            let group = state
                .topics
                .get_mut(&self.topic)
                .and_then(|log| log.groups.get_mut(&self.group))
                .ok_or_else(stale)?;
            let p = delivery.partition as usize;
            let expected = InFlight {
                offset: delivery.offset,
                member: self.member,
            };

            match group.in_flight.get(p).copied().flatten() {
                Some(in_flight) if in_flight == expected && delivery.topic == self.topic => {
                    group.in_flight[p] = None;
                    if commit {
                        group.committed[p] = delivery.offset + 1;
                    }
                }
                _ => return Err(stale()),
            }
        }

        self.shared.notify();
        Ok(())
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, ChannelError> {
        loop {
            // Mark the current version seen before looking, so a publish racing with the
            // scan below still wakes us up.
            let _ = self.changes.borrow_and_update();

            {
                let shared = self.shared.clone();
                let mut state = shared.lock()?;
                if state.closed {
                    return Ok(None);
                }
                if let Some(delivery) = self.take_next(&mut state) {
                    return Ok(Some(delivery));
                }
            }

            if self.changes.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn try_next(&mut self) -> Result<Option<Delivery>, ChannelError> {
        let shared = self.shared.clone();
        let mut state = shared.lock()?;
        if state.closed {
            return Ok(None);
        }
        Ok(self.take_next(&mut state))
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<(), ChannelError> {
        self.settle(delivery, true)
    }

    async fn release(&mut self, delivery: &Delivery) -> Result<(), ChannelError> {
        self.settle(delivery, false)
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            if let Some(group) = state
                .topics
                .get_mut(&self.topic)
                .and_then(|log| log.groups.get_mut(&self.group))
            {
                group.members.retain(|m| *m != self.member);
                for slot in group.in_flight.iter_mut() {
                    if slot.is_some_and(|f| f.member == self.member) {
                        *slot = None;
                    }
                }
            }
        }
        self.shared.notify();
    }
}
