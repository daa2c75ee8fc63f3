//! Durable, partitioned event streams with consumer groups.
//!
//! This module defines the [`StreamLog`] port that durable log backends
//! implement, the record and message types that travel through it, and the
//! [`manager::StreamManager`] that implements the producer/consumer
//! protocol on top of any backend: queue selection, batching, throttling,
//! publish retries, read polling and a circuit breaker on the read side.
//!
//! A stream is partitioned by queue. Each (stream, queue) partition is an
//! ordered log addressed by [`MessageId`]. Consumer groups keep their own
//! cursor and pending set per partition, so distinct groups each see every
//! message while members of one group compete for them.

pub mod batch;
pub mod breaker;
pub mod manager;
pub mod retry;
pub mod throttle;

use crate::collaborators::Principal;
use crate::errors::StreamLogResult;
use crate::types::{
    ConsumerGroup, ConsumerId, EventId, EventName, MessageId, QueueName, StreamName, Timestamp,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub use batch::{BatchPublisher, FlushPolicy};
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use manager::{PublishTarget, StreamManager};
pub use retry::RetryConfig;
pub use throttle::Throttle;

/// Header envelope stored with every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique id of the produced event
    pub event_id: EventId,
    /// When the producing event was triggered
    pub event_ts: Timestamp,
    /// When the record was handed to the stream
    pub submit_ts: Timestamp,
    /// Event that produced the record
    pub producer: Option<EventName>,
    /// Correlation ids propagated end-to-end (`track.` prefixed keys)
    pub track: BTreeMap<String, String>,
    /// Caller the producing event was authenticated as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Principal>,
}

impl Envelope {
    /// An envelope for a record produced now.
    pub fn new(event_ts: Timestamp, track: BTreeMap<String, String>) -> Self {
        Self {
            event_id: EventId::new(),
            event_ts,
            submit_ts: Timestamp::now(),
            producer: None,
            track,
            auth: None,
        }
    }

    /// Sets the producing event.
    #[must_use]
    pub fn with_producer(mut self, producer: EventName) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Carries the producer's authenticated caller to consumers.
    #[must_use]
    pub fn with_auth(mut self, auth: Option<Principal>) -> Self {
        self.auth = auth;
        self
    }
}

/// A payload and its envelope, as appended to a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    /// Header envelope
    pub envelope: Envelope,
    /// Opaque payload
    pub payload: Value,
}

impl StreamRecord {
    /// Creates a record with a fresh envelope.
    pub fn new(payload: Value, event_ts: Timestamp, track: BTreeMap<String, String>) -> Self {
        Self {
            envelope: Envelope::new(event_ts, track),
            payload,
        }
    }

    /// Serialized size in bytes, used for batch size accounting.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map_or(0, |bytes| bytes.len())
    }
}

/// A record as held by a log backend, claimed by one group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Position in its partition
    pub msg_id: MessageId,
    /// Partition the record lives in
    pub queue: QueueName,
    /// The stored record
    pub record: StreamRecord,
    /// 1 on first delivery, incremented on every redelivery
    pub delivery_count: u32,
}

/// A message delivered to a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamMessage {
    /// Source stream
    pub stream: StreamName,
    /// Position in its partition
    pub msg_id: MessageId,
    /// Queue the message was published to
    pub queue: QueueName,
    /// Group the message was delivered to
    pub consumer_group: ConsumerGroup,
    /// Unique id of the produced event
    pub event_id: EventId,
    /// When the producing event was triggered
    pub event_ts: Timestamp,
    /// When the record was handed to the stream
    pub submit_ts: Timestamp,
    /// When the record was delivered; stamped at delivery, never earlier
    pub read_ts: Timestamp,
    /// Event that produced the record
    pub producer: Option<EventName>,
    /// Correlation ids
    pub track: BTreeMap<String, String>,
    /// Caller the producing event was authenticated as
    pub auth: Option<Principal>,
    /// 1 on first delivery, incremented on every redelivery
    pub delivery_count: u32,
    /// Opaque payload
    pub payload: Value,
}

impl StreamMessage {
    /// Builds the delivered message for a claimed entry, stamping `read_ts` now.
    pub fn delivered(stream: &StreamName, group: &ConsumerGroup, entry: StreamEntry) -> Self {
        let StreamEntry {
            msg_id,
            queue,
            record: StreamRecord { envelope, payload },
            delivery_count,
        } = entry;
        Self {
            stream: stream.clone(),
            msg_id,
            queue,
            consumer_group: group.clone(),
            event_id: envelope.event_id,
            event_ts: envelope.event_ts,
            submit_ts: envelope.submit_ts,
            read_ts: Timestamp::now(),
            producer: envelope.producer,
            track: envelope.track,
            auth: envelope.auth,
            delivery_count,
            payload,
        }
    }

    /// Correlation fields for structured logs.
    pub fn log_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("stream.name".into(), json!(self.stream.to_string()));
        fields.insert("stream.msg_id".into(), json!(self.msg_id.to_string()));
        fields.insert("stream.queue".into(), json!(self.queue.to_string()));
        fields.insert("stream.consumer_group".into(), json!(self.consumer_group.to_string()));
        fields.insert("stream.event_id".into(), json!(self.event_id.to_string()));
        fields.insert("stream.event_ts".into(), json!(self.event_ts.to_rfc3339()));
        fields.insert("stream.submit_ts".into(), json!(self.submit_ts.to_rfc3339()));
        fields.insert("stream.read_ts".into(), json!(self.read_ts.to_rfc3339()));
        fields.insert("stream.delivery_count".into(), json!(self.delivery_count));
        for (key, value) in &self.track {
            fields.insert(key.clone(), json!(value));
        }
        fields
    }
}

/// Port interface for durable log backends.
///
/// Implementations must serialize trimming against appends, claim entries
/// atomically so no two members of one group receive the same entry, and
/// make `ack` atomic with respect to concurrent reads of the group.
#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Appends `records` to one partition in a single operation.
    ///
    /// With `target_max_len`, the partition is trimmed oldest-first to
    /// approximately that many entries.
    async fn append(
        &self,
        stream: &StreamName,
        queue: &QueueName,
        records: Vec<StreamRecord>,
        target_max_len: Option<u64>,
    ) -> StreamLogResult<Vec<MessageId>>;

    /// Registers a consumer group reading from the start of the stream.
    /// Idempotent.
    async fn ensure_group(&self, stream: &StreamName, group: &ConsumerGroup) -> StreamLogResult<()>;

    /// Queues currently present on the stream, sorted.
    async fn queues(&self, stream: &StreamName) -> StreamLogResult<Vec<QueueName>>;

    /// Claims up to `count` entries for `consumer`, visiting `queues` in order.
    ///
    /// Released entries are handed out before new ones.
    async fn read_group(
        &self,
        stream: &StreamName,
        group: &ConsumerGroup,
        consumer: &ConsumerId,
        queues: &[QueueName],
        count: usize,
    ) -> StreamLogResult<Vec<StreamEntry>>;

    /// Waits up to `timeout` for new data on the stream; `true` if any arrived.
    async fn wait_for_data(&self, stream: &StreamName, timeout: Duration) -> StreamLogResult<bool>;

    /// Acknowledges a pending entry, advancing the group's cursor.
    async fn ack(
        &self,
        stream: &StreamName,
        group: &ConsumerGroup,
        queue: &QueueName,
        msg_id: MessageId,
    ) -> StreamLogResult<()>;

    /// Returns a pending entry to the group for redelivery.
    async fn release(
        &self,
        stream: &StreamName,
        group: &ConsumerGroup,
        queue: &QueueName,
        msg_id: MessageId,
    ) -> StreamLogResult<()>;

    /// Retained entries in one partition.
    async fn len(&self, stream: &StreamName, queue: &QueueName) -> StreamLogResult<usize>;

    /// Last acknowledged id of a group in one partition.
    async fn cursor(
        &self,
        stream: &StreamName,
        group: &ConsumerGroup,
        queue: &QueueName,
    ) -> StreamLogResult<Option<MessageId>>;
}

#[async_trait]
impl<T: StreamLog + ?Sized> StreamLog for Arc<T> {
    async fn append(
        &self,
        stream: &StreamName,
        queue: &QueueName,
        records: Vec<StreamRecord>,
        target_max_len: Option<u64>,
    ) -> StreamLogResult<Vec<MessageId>> {
        (**self).append(stream, queue, records, target_max_len).await
    }

    async fn ensure_group(
        &self,
        stream: &StreamName,
        group: &ConsumerGroup,
    ) -> StreamLogResult<()> {
        (**self).ensure_group(stream, group).await
    }

    async fn queues(&self, stream: &StreamName) -> StreamLogResult<Vec<QueueName>> {
        (**self).queues(stream).await
    }

    async fn read_group(
        &self,
        stream: &StreamName,
        group: &ConsumerGroup,
        consumer: &ConsumerId,
        queues: &[QueueName],
        count: usize,
    ) -> StreamLogResult<Vec<StreamEntry>> {
        (**self).read_group(stream, group, consumer, queues, count).await
    }

    async fn wait_for_data(&self, stream: &StreamName, timeout: Duration) -> StreamLogResult<bool> {
        (**self).wait_for_data(stream, timeout).await
    }

    async fn ack(
        &self,
        stream: &StreamName,
        group: &ConsumerGroup,
        queue: &QueueName,
        msg_id: MessageId,
    ) -> StreamLogResult<()> {
        (**self).ack(stream, group, queue, msg_id).await
    }

    async fn release(
        &self,
        stream: &StreamName,
        group: &ConsumerGroup,
        queue: &QueueName,
        msg_id: MessageId,
    ) -> StreamLogResult<()> {
        (**self).release(stream, group, queue, msg_id).await
    }

    async fn len(&self, stream: &StreamName, queue: &QueueName) -> StreamLogResult<usize> {
        (**self).len(stream, queue).await
    }

    async fn cursor(
        &self,
        stream: &StreamName,
        group: &ConsumerGroup,
        queue: &QueueName,
    ) -> StreamLogResult<Option<MessageId>> {
        (**self).cursor(stream, group, queue).await
    }
}

/// Expands a read binding's queues against the queues present on a stream.
///
/// Named queues come first in declared order. `AUTO` expands to every other
/// queue on the stream, the default `AUTO` queue first and the rest sorted,
/// so queues created after subscription are picked up on the next read.
pub fn select_queues(declared: &[QueueName], present: &[QueueName]) -> Vec<QueueName> {
    let mut selected: Vec<QueueName> = declared.iter().filter(|q| !q.is_auto()).cloned().collect();
    if declared.iter().any(QueueName::is_auto) {
        let mut rest: Vec<QueueName> = present
            .iter()
            .chain(std::iter::once(&QueueName::auto()))
            .filter(|q| !selected.contains(q))
            .cloned()
            .collect();
        rest.sort_by(|a, b| b.is_auto().cmp(&a.is_auto()).then_with(|| a.cmp(b)));
        rest.dedup();
        selected.extend(rest);
    }
    selected
}
