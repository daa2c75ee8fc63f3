//! Stream producer/consumer protocol over a [`StreamLog`] backend.

use super::batch::{BatchPublisher, FlushPolicy};
use super::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use super::retry::{Exhausted, RetryConfig};
use super::throttle::Throttle;
use super::{select_queues, StreamLog, StreamMessage, StreamRecord};
use crate::config::{QueueStrategy, ReadStreamDescriptor, StreamsConfig, WriteStreamDescriptor};
use crate::errors::{StreamError, StreamResult};
use crate::types::{ConsumerId, EventName, MessageId, QueueName, StreamName};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace};

/// Where and how one producer publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    /// Target stream
    pub stream: StreamName,
    /// Queue records are tagged with
    pub queue: QueueName,
    /// Approximate retained length per queue
    pub target_max_len: Option<u64>,
    /// Minimum interval between publishes from this producer
    pub throttle: Option<Duration>,
    /// Producing event, used to scope throttling
    pub producer: Option<EventName>,
}

impl PublishTarget {
    /// An unbounded, unthrottled target.
    pub const fn new(stream: StreamName, queue: QueueName) -> Self {
        Self {
            stream,
            queue,
            target_max_len: None,
            throttle: None,
            producer: None,
        }
    }

    /// Caps retained length per queue.
    #[must_use]
    pub const fn with_max_len(mut self, target_max_len: u64) -> Self {
        self.target_max_len = Some(target_max_len);
        self
    }

    /// Limits publishes to one per `interval`.
    #[must_use]
    pub const fn with_throttle(mut self, interval: Duration) -> Self {
        self.throttle = Some(interval);
        self
    }

    /// Scopes throttling to a producing event.
    #[must_use]
    pub fn with_producer(mut self, producer: EventName) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Targets for every queue of a write binding.
    ///
    /// With [`QueueStrategy::Propagate`], an `AUTO` queue is replaced by the
    /// queue of the triggering message, if there is one.
    pub fn from_binding(
        binding: &WriteStreamDescriptor,
        producer: &EventName,
        upstream_queue: Option<&QueueName>,
    ) -> Vec<Self> {
        binding
            .queues
            .iter()
            .map(|queue| {
                let queue = match (binding.queue_strategy, upstream_queue) {
                    (QueueStrategy::Propagate, Some(upstream)) if queue.is_auto() => {
                        upstream.clone()
                    }
                    _ => queue.clone(),
                };
                Self {
                    stream: binding.name.clone(),
                    queue,
                    target_max_len: binding.target_max_len,
                    throttle: binding.throttle,
                    producer: Some(producer.clone()),
                }
            })
            .collect()
    }
}

type ThrottleKey = (Option<EventName>, StreamName);

struct Inner {
    log: Arc<dyn StreamLog>,
    retry: RetryConfig,
    breaker: CircuitBreaker,
    consumer_id: ConsumerId,
    throttles: Mutex<HashMap<ThrottleKey, Arc<Throttle>>>,
}

/// Implements publishing and consumer-group reads on top of a backend.
///
/// Cheap to clone; clones share throttle state.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("consumer_id", &self.inner.consumer_id)
            .field("retry", &self.inner.retry)
            .field("circuit", &self.inner.breaker.state())
            .finish_non_exhaustive()
    }
}

impl StreamManager {
    /// Creates a manager with default retries and a generated consumer id.
    pub fn new(log: Arc<dyn StreamLog>) -> Self {
        Self::with_config(log, RetryConfig::default(), ConsumerId::generate())
    }

    /// Creates a manager with retry and circuit breaker settings taken from
    /// the server's stream tunables.
    pub fn from_config(log: Arc<dyn StreamLog>, config: &StreamsConfig) -> Self {
        Self::with_breaker(
            log,
            RetryConfig::from(config),
            BreakerConfig::from(config),
            ConsumerId::generate(),
        )
    }

    /// Creates a manager with explicit retry settings and consumer id.
    pub fn with_config(
        log: Arc<dyn StreamLog>,
        retry: RetryConfig,
        consumer_id: ConsumerId,
    ) -> Self {
        Self::with_breaker(log, retry, BreakerConfig::default(), consumer_id)
    }

    /// Creates a manager with explicit retry, circuit breaker and consumer id.
    pub fn with_breaker(
        log: Arc<dyn StreamLog>,
        retry: RetryConfig,
        breaker: BreakerConfig,
        consumer_id: ConsumerId,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                log,
                retry,
                breaker: CircuitBreaker::new(breaker),
                consumer_id,
                throttles: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The underlying backend.
    pub fn log(&self) -> &Arc<dyn StreamLog> {
        &self.inner.log
    }

    /// The consumer id this process reads as.
    pub fn consumer_id(&self) -> &ConsumerId {
        &self.inner.consumer_id
    }

    /// State of the circuit breaker guarding reads and registrations.
    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    fn throttle_for(&self, target: &PublishTarget) -> Option<Arc<Throttle>> {
        let interval = target.throttle.filter(|interval| !interval.is_zero())?;
        let key = (target.producer.clone(), target.stream.clone());
        let mut throttles = self.inner.throttles.lock();
        Some(Arc::clone(
            throttles
                .entry(key)
                .or_insert_with(|| Arc::new(Throttle::new(interval))),
        ))
    }

    /// Publishes one record.
    pub async fn publish(
        &self,
        target: &PublishTarget,
        record: StreamRecord,
    ) -> StreamResult<MessageId> {
        let ids = self.publish_batch(target, vec![record]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| StreamError::Serialization("backend returned no message id".to_string()))
    }

    /// Publishes records with one underlying append.
    ///
    /// Throttling applies per append; the call waits for its slot before
    /// writing. Transient failures are retried with backoff.
    #[instrument(
        skip(self, records),
        fields(stream = %target.stream, queue = %target.queue, count = records.len())
    )]
    pub async fn publish_batch(
        &self,
        target: &PublishTarget,
        records: Vec<StreamRecord>,
    ) -> StreamResult<Vec<MessageId>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(throttle) = self.throttle_for(target) {
            throttle.acquire().await;
        }

        let log = &self.inner.log;
        let records = &records;
        let ids = self
            .inner
            .retry
            .run("append", move || {
                log.append(&target.stream, &target.queue, records.clone(), target.target_max_len)
            })
            .await
            .map_err(|Exhausted { attempts, error }| StreamError::Publish {
                stream: target.stream.clone(),
                attempts,
                source: error,
            })?;
        debug!(published = ids.len(), "records appended");
        Ok(ids)
    }

    /// Creates a batching publisher for a target.
    pub fn batch_publisher(&self, target: PublishTarget, policy: FlushPolicy) -> BatchPublisher {
        BatchPublisher::spawn(self.clone(), target, policy)
    }

    /// Registers the consumer group of a read binding.
    ///
    /// Goes through the circuit breaker; fails with
    /// [`StreamError::CircuitOpen`] while the backend is considered down.
    pub async fn register_consumer(&self, binding: &ReadStreamDescriptor) -> StreamResult<()> {
        let log = &self.inner.log;
        self.inner
            .breaker
            .call(|| log.ensure_group(&binding.name, &binding.consumer_group))
            .await?;
        debug!(
            stream = %binding.name,
            consumer_group = %binding.consumer_group,
            "consumer group registered"
        );
        Ok(())
    }

    /// Queues a read binding currently covers.
    pub async fn subscribed_queues(
        &self,
        binding: &ReadStreamDescriptor,
    ) -> StreamResult<Vec<QueueName>> {
        let log = &self.inner.log;
        let present = self.inner.breaker.call(|| log.queues(&binding.name)).await?;
        Ok(select_queues(&binding.queues, &present))
    }

    /// Claims up to `count` messages for this process.
    ///
    /// If nothing is available the call blocks up to `timeout` for new data
    /// and reads once more. `read_ts` is stamped as messages are handed out.
    /// Backend calls go through the circuit breaker.
    pub async fn read(
        &self,
        binding: &ReadStreamDescriptor,
        count: usize,
        timeout: Duration,
    ) -> StreamResult<Vec<StreamMessage>> {
        let mut messages = self.read_once(binding, count).await?;
        let log = &self.inner.log;
        if messages.is_empty()
            && self
                .inner
                .breaker
                .call(|| log.wait_for_data(&binding.name, timeout))
                .await?
        {
            messages = self.read_once(binding, count).await?;
        }
        Ok(messages)
    }

    async fn read_once(
        &self,
        binding: &ReadStreamDescriptor,
        count: usize,
    ) -> StreamResult<Vec<StreamMessage>> {
        let queues = self.subscribed_queues(binding).await?;
        let log = &self.inner.log;
        let entries = self
            .inner
            .breaker
            .call(|| {
                log.read_group(
                    &binding.name,
                    &binding.consumer_group,
                    &self.inner.consumer_id,
                    &queues,
                    count,
                )
            })
            .await?;
        trace!(stream = %binding.name, claimed = entries.len(), "read_group");
        Ok(entries
            .into_iter()
            .map(|entry| StreamMessage::delivered(&binding.name, &binding.consumer_group, entry))
            .collect())
    }

    /// Acknowledges a handled message.
    pub async fn ack(&self, message: &StreamMessage) -> StreamResult<()> {
        self.inner
            .log
            .ack(&message.stream, &message.consumer_group, &message.queue, message.msg_id)
            .await?;
        Ok(())
    }

    /// Returns a message to its group for redelivery.
    pub async fn release(&self, message: &StreamMessage) -> StreamResult<()> {
        self.inner
            .log
            .release(&message.stream, &message.consumer_group, &message.queue, message.msg_id)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BatchSize;

    fn stream(name: &str) -> StreamName {
        StreamName::try_new(name).unwrap()
    }

    fn queue(name: &str) -> QueueName {
        QueueName::try_new(name).unwrap()
    }

    fn binding(queues: Vec<QueueName>, strategy: QueueStrategy) -> WriteStreamDescriptor {
        WriteStreamDescriptor {
            name: stream("out"),
            queues,
            queue_strategy: strategy,
            target_max_len: Some(10),
            throttle: None,
            batch_size: BatchSize::default_size(),
        }
    }

    #[test]
    fn propagate_replaces_auto_with_upstream_queue() {
        let producer = EventName::try_new("producer").unwrap();
        let upstream = queue("high-prio");
        let targets = PublishTarget::from_binding(
            &binding(vec![QueueName::auto(), queue("audit")], QueueStrategy::Propagate),
            &producer,
            Some(&upstream),
        );
        let queues: Vec<QueueName> = targets.iter().map(|t| t.queue.clone()).collect();
        assert_eq!(queues, vec![queue("high-prio"), queue("audit")]);
        assert_eq!(targets[0].target_max_len, Some(10));
    }

    #[test]
    fn drop_keeps_configured_queue() {
        let producer = EventName::try_new("producer").unwrap();
        let upstream = queue("high-prio");
        let targets = PublishTarget::from_binding(
            &binding(vec![QueueName::auto()], QueueStrategy::Drop),
            &producer,
            Some(&upstream),
        );
        assert!(targets[0].queue.is_auto());
    }

    #[test]
    fn propagate_without_upstream_keeps_auto() {
        let producer = EventName::try_new("producer").unwrap();
        let targets = PublishTarget::from_binding(
            &binding(vec![QueueName::auto()], QueueStrategy::Propagate),
            &producer,
            None,
        );
        assert!(targets[0].queue.is_auto());
    }
}
