//! In-memory adapters for `Eventline`
//!
//! This crate provides in-memory implementations of the [`StreamLog`] and
//! [`Storage`] traits from the eventline crate, useful for testing and
//! development scenarios where durability is not required.
//!
//! The stream log keeps one ordered partition per (stream, queue). Consumer
//! groups are registered per stream and track, per partition, the last id
//! handed out, the entries delivered but not yet acknowledged, and the
//! entries released for redelivery. Pending entries keep a copy of their
//! record, so trimming never loses a message that was already delivered.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventline::collaborators::Storage;
use eventline::errors::{StorageError, StorageResult, StreamLogError, StreamLogResult};
use eventline::stream::{StreamEntry, StreamLog, StreamRecord};
use eventline::types::{ConsumerGroup, ConsumerId, MessageId, QueueName, StreamName};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::trace;

/// Entries a partition may exceed `target_max_len` by before it is trimmed.
///
/// Trimming happens in chunks, like an approximate `MAXLEN ~` trim: the
/// partition grows to `max_len + slack` and is then cut back to `max_len`.
pub fn trim_slack(max_len: u64) -> u64 {
    max_len.div_ceil(10).max(1)
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

#[derive(Debug, Clone)]
struct Pending {
    consumer: ConsumerId,
    record: StreamRecord,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: MessageId,
    pending: BTreeMap<MessageId, Pending>,
    released: VecDeque<MessageId>,
    cursor: Option<MessageId>,
}

#[derive(Debug, Default)]
struct Partition {
    entries: VecDeque<(MessageId, StreamRecord)>,
    last_id: MessageId,
    groups: HashMap<ConsumerGroup, GroupState>,
}

impl Partition {
    fn append(&mut self, records: Vec<StreamRecord>) -> Vec<MessageId> {
        let now = now_millis();
        records
            .into_iter()
            .map(|record| {
                let id = self.last_id.next_after(now);
                self.last_id = id;
                self.entries.push_back((id, record));
                id
            })
            .collect()
    }

    fn trim(&mut self, max_len: u64) -> usize {
        let limit =
            usize::try_from(max_len.saturating_add(trim_slack(max_len))).unwrap_or(usize::MAX);
        if self.entries.len() <= limit {
            return 0;
        }
        let keep = usize::try_from(max_len).unwrap_or(usize::MAX);
        let evicted = self.entries.len() - keep;
        self.entries.drain(..evicted);
        evicted
    }

    /// Claims released entries first, then entries never delivered to the group.
    fn claim(
        &mut self,
        queue: &QueueName,
        group: &ConsumerGroup,
        consumer: &ConsumerId,
        count: usize,
    ) -> Vec<StreamEntry> {
        let Self { entries, groups, .. } = self;
        let state = groups.entry(group.clone()).or_default();
        let mut claimed = Vec::new();

        while claimed.len() < count {
            let Some(msg_id) = state.released.pop_front() else {
                break;
            };
            if let Some(pending) = state.pending.get_mut(&msg_id) {
                pending.consumer = consumer.clone();
                pending.delivery_count += 1;
                claimed.push(StreamEntry {
                    msg_id,
                    queue: queue.clone(),
                    record: pending.record.clone(),
                    delivery_count: pending.delivery_count,
                });
            }
        }

        let start = entries.partition_point(|(id, _)| *id <= state.last_delivered);
        for (msg_id, record) in entries.iter().skip(start).take(count - claimed.len()) {
            state.last_delivered = *msg_id;
            state.pending.insert(
                *msg_id,
                Pending {
                    consumer: consumer.clone(),
                    record: record.clone(),
                    delivery_count: 1,
                },
            );
            claimed.push(StreamEntry {
                msg_id: *msg_id,
                queue: queue.clone(),
                record: record.clone(),
                delivery_count: 1,
            });
        }
        claimed
    }
}

#[derive(Debug, Default)]
struct StreamState {
    partitions: BTreeMap<QueueName, Partition>,
    groups: HashSet<ConsumerGroup>,
    notify: Arc<Notify>,
}

/// Thread-safe in-memory stream log for testing
#[derive(Debug, Clone, Default)]
pub struct InMemoryStreamLog {
    streams: Arc<Mutex<HashMap<StreamName, StreamState>>>,
}

impl InMemoryStreamLog {
    /// Create a new empty in-memory stream log
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumers currently holding unacknowledged entries of a group, with counts.
    pub fn pending_by_consumer(
        &self,
        stream: &StreamName,
        group: &ConsumerGroup,
    ) -> HashMap<ConsumerId, usize> {
        let streams = self.streams.lock();
        let mut counts = HashMap::new();
        if let Some(state) = streams.get(stream) {
            for partition in state.partitions.values() {
                if let Some(group_state) = partition.groups.get(group) {
                    for pending in group_state.pending.values() {
                        *counts.entry(pending.consumer.clone()).or_insert(0) += 1;
                    }
                }
            }
        }
        counts
    }

    fn unknown_group(stream: &StreamName, group: &ConsumerGroup) -> StreamLogError {
        StreamLogError::GroupNotFound {
            stream: stream.clone(),
            group: group.clone(),
        }
    }

    fn with_group<T>(
        &self,
        stream: &StreamName,
        group: &ConsumerGroup,
        queue: &QueueName,
        msg_id: MessageId,
        f: impl FnOnce(&mut GroupState) -> Option<T>,
    ) -> StreamLogResult<T> {
        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(stream)
            .filter(|state| state.groups.contains(group))
            .ok_or_else(|| Self::unknown_group(stream, group))?;
        let outcome = state
            .partitions
            .get_mut(queue)
            .and_then(|partition| partition.groups.get_mut(group))
            .and_then(f);
        let notify = Arc::clone(&state.notify);
        drop(streams);
        outcome
            .map(|value| {
                notify.notify_waiters();
                value
            })
            .ok_or_else(|| StreamLogError::NotPending {
                stream: stream.clone(),
                queue: queue.clone(),
                group: group.clone(),
                msg_id,
            })
    }
}

#[async_trait]
impl StreamLog for InMemoryStreamLog {
    async fn append(
        &self,
        stream: &StreamName,
        queue: &QueueName,
        records: Vec<StreamRecord>,
        target_max_len: Option<u64>,
    ) -> StreamLogResult<Vec<MessageId>> {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.clone()).or_default();
        let partition = state.partitions.entry(queue.clone()).or_default();
        let ids = partition.append(records);
        if let Some(max_len) = target_max_len {
            let evicted = partition.trim(max_len);
            if evicted > 0 {
                trace!(stream = %stream, queue = %queue, evicted, "partition trimmed");
            }
        }
        let notify = Arc::clone(&state.notify);
        drop(streams);
        notify.notify_waiters();
        Ok(ids)
    }

    async fn ensure_group(
        &self,
        stream: &StreamName,
        group: &ConsumerGroup,
    ) -> StreamLogResult<()> {
        self.streams
            .lock()
            .entry(stream.clone())
            .or_default()
            .groups
            .insert(group.clone());
        Ok(())
    }

    async fn queues(&self, stream: &StreamName) -> StreamLogResult<Vec<QueueName>> {
        Ok(self
            .streams
            .lock()
            .get(stream)
            .map(|state| state.partitions.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn read_group(
        &self,
        stream: &StreamName,
        group: &ConsumerGroup,
        consumer: &ConsumerId,
        queues: &[QueueName],
        count: usize,
    ) -> StreamLogResult<Vec<StreamEntry>> {
        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(stream)
            .filter(|state| state.groups.contains(group))
            .ok_or_else(|| Self::unknown_group(stream, group))?;

        let mut claimed = Vec::new();
        for queue in queues {
            let remaining = count - claimed.len();
            if remaining == 0 {
                break;
            }
            if let Some(partition) = state.partitions.get_mut(queue) {
                claimed.extend(partition.claim(queue, group, consumer, remaining));
            }
        }
        Ok(claimed)
    }

    async fn wait_for_data(&self, stream: &StreamName, timeout: Duration) -> StreamLogResult<bool> {
        let notify = Arc::clone(&self.streams.lock().entry(stream.clone()).or_default().notify);
        Ok(tokio::time::timeout(timeout, notify.notified()).await.is_ok())
    }

    async fn ack(
        &self,
        stream: &StreamName,
        group: &ConsumerGroup,
        queue: &QueueName,
        msg_id: MessageId,
    ) -> StreamLogResult<()> {
        self.with_group(stream, group, queue, msg_id, |state| {
            state.pending.remove(&msg_id)?;
            state.released.retain(|released| *released != msg_id);
            state.cursor = Some(state.cursor.map_or(msg_id, |cursor| cursor.max(msg_id)));
            Some(())
        })
    }

    async fn release(
        &self,
        stream: &StreamName,
        group: &ConsumerGroup,
        queue: &QueueName,
        msg_id: MessageId,
    ) -> StreamLogResult<()> {
        self.with_group(stream, group, queue, msg_id, |state| {
            state.pending.get(&msg_id)?;
            if !state.released.contains(&msg_id) {
                state.released.push_front(msg_id);
            }
            Some(())
        })
    }

    async fn len(&self, stream: &StreamName, queue: &QueueName) -> StreamLogResult<usize> {
        Ok(self
            .streams
            .lock()
            .get(stream)
            .and_then(|state| state.partitions.get(queue))
            .map_or(0, |partition| partition.entries.len()))
    }

    async fn cursor(
        &self,
        stream: &StreamName,
        group: &ConsumerGroup,
        queue: &QueueName,
    ) -> StreamLogResult<Option<MessageId>> {
        let streams = self.streams.lock();
        let state = streams
            .get(stream)
            .filter(|state| state.groups.contains(group))
            .ok_or_else(|| Self::unknown_group(stream, group))?;
        Ok(state
            .partitions
            .get(queue)
            .and_then(|partition| partition.groups.get(group))
            .and_then(|group_state| group_state.cursor))
    }
}

/// Thread-safe in-memory key/value storage for testing
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    items: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryStorage {
    /// Create a new empty storage
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> StorageResult<()> {
        if key.trim().is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        self.items.write().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.items.read().get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .items
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slack_is_ten_percent_rounded_up() {
        assert_eq!(trim_slack(0), 1);
        assert_eq!(trim_slack(5), 1);
        assert_eq!(trim_slack(10), 1);
        assert_eq!(trim_slack(11), 2);
        assert_eq!(trim_slack(1000), 100);
    }

    #[test]
    fn partition_ids_increase() {
        let mut partition = Partition::default();
        let record = StreamRecord::new(
            serde_json::json!(1),
            eventline::types::Timestamp::now(),
            BTreeMap::new(),
        );
        let ids = partition.append(vec![record.clone(), record.clone(), record]);
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(partition.last_id, ids[2]);
    }
}
