//! Dual-trigger batching for periodic producers.
//!
//! Records are buffered and flushed as one append when the batch reaches
//! `max_count` records, reaches `max_bytes` serialized bytes, or has been
//! open for `flush_interval`, whichever comes first.
//!
//! A flush that fails keeps its records in the batch for the next flush.
//! Failures of count, size or time triggered flushes are reported by the
//! next [`BatchPublisher::send`].

use super::manager::{PublishTarget, StreamManager};
use super::StreamRecord;
use crate::config::StreamsConfig;
use crate::errors::{StreamError, StreamResult};
use crate::types::{BatchSize, MessageId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error};

/// When a batch is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Flush once this many records are buffered
    pub max_count: BatchSize,
    /// Flush once the oldest buffered record is this old
    pub flush_interval: Duration,
    /// Flush once buffered records serialize to this many bytes
    pub max_bytes: usize,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_count: BatchSize::default_size(),
            flush_interval: Duration::from_millis(500),
            max_bytes: 1024 * 1024,
        }
    }
}

impl FlushPolicy {
    /// Policy from the server stream settings and a binding's batch size.
    pub fn from_config(config: &StreamsConfig, max_count: BatchSize) -> Self {
        Self {
            max_count,
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            max_bytes: config.flush_max_size,
        }
    }
}

/// Records waiting to be flushed.
#[derive(Debug)]
pub struct Batch {
    policy: FlushPolicy,
    records: Vec<StreamRecord>,
    bytes: usize,
    opened_at: Option<Instant>,
}

impl Batch {
    /// An empty batch.
    pub const fn new(policy: FlushPolicy) -> Self {
        Self {
            policy,
            records: Vec::new(),
            bytes: 0,
            opened_at: None,
        }
    }

    /// Buffers a record.
    pub fn push(&mut self, record: StreamRecord) {
        self.bytes += record.encoded_len();
        self.opened_at.get_or_insert_with(Instant::now);
        self.records.push(record);
    }

    /// Whether the count or size trigger fired.
    pub fn is_full(&self) -> bool {
        self.records.len() >= usize::from(self.policy.max_count)
            || self.bytes >= self.policy.max_bytes
    }

    /// When the time trigger fires, if anything is buffered.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.policy.flush_interval)
    }

    /// Buffered records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Empties the batch, returning its records.
    pub fn take(&mut self) -> Vec<StreamRecord> {
        self.bytes = 0;
        self.opened_at = None;
        std::mem::take(&mut self.records)
    }

    /// Puts back records of a failed flush, ahead of anything buffered since.
    ///
    /// The time trigger restarts, so the next attempt waits a full interval
    /// unless the count or size trigger fires first.
    pub fn restore(&mut self, mut records: Vec<StreamRecord>) {
        if records.is_empty() {
            return;
        }
        self.bytes += records.iter().map(StreamRecord::encoded_len).sum::<usize>();
        records.append(&mut self.records);
        self.records = records;
        self.opened_at = Some(Instant::now());
    }
}

enum Command {
    Record(StreamRecord),
    Flush(oneshot::Sender<StreamResult<Vec<MessageId>>>),
}

type FailureSlot = Arc<Mutex<Option<StreamError>>>;

/// Background task batching records for one target.
#[derive(Debug)]
pub struct BatchPublisher {
    sender: mpsc::Sender<Command>,
    handle: JoinHandle<StreamResult<usize>>,
    target: PublishTarget,
    failure: FailureSlot,
}

impl BatchPublisher {
    /// Spawns the batching task.
    pub fn spawn(manager: StreamManager, target: PublishTarget, policy: FlushPolicy) -> Self {
        let capacity = usize::from(policy.max_count).max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let failure = FailureSlot::default();
        let handle = tokio::spawn(run_batcher(
            manager,
            target.clone(),
            policy,
            receiver,
            Arc::clone(&failure),
        ));
        Self {
            sender,
            handle,
            target,
            failure,
        }
    }

    /// Takes the failure of a background flush not yet reported.
    pub fn take_failure(&self) -> Option<StreamError> {
        self.failure.lock().take()
    }

    /// Buffers a record; waits if the task is behind.
    ///
    /// # Errors
    ///
    /// The failure of an earlier background flush, if one is unreported. The
    /// record is buffered regardless, and the failed records stay buffered
    /// for the next flush.
    pub async fn send(&self, record: StreamRecord) -> StreamResult<()> {
        self.sender
            .send(Command::Record(record))
            .await
            .map_err(|_| StreamError::BatcherClosed(self.target.stream.clone()))?;
        self.take_failure().map_or(Ok(()), Err)
    }

    /// Flushes whatever is buffered now, records kept from failed flushes
    /// included.
    ///
    /// # Errors
    ///
    /// The append failure; the records stay buffered.
    pub async fn flush(&self) -> StreamResult<Vec<MessageId>> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Command::Flush(reply))
            .await
            .map_err(|_| StreamError::BatcherClosed(self.target.stream.clone()))?;
        response
            .await
            .map_err(|_| StreamError::BatcherClosed(self.target.stream.clone()))?
    }

    /// Flushes remaining records and stops the task, returning how many
    /// records it published in total.
    ///
    /// # Errors
    ///
    /// The failure of the final flush; the records still buffered are lost.
    pub async fn close(self) -> StreamResult<usize> {
        drop(self.sender);
        self.handle
            .await
            .map_err(|_| StreamError::BatcherClosed(self.target.stream.clone()))?
    }
}

async fn flush_batch(
    manager: &StreamManager,
    target: &PublishTarget,
    batch: &mut Batch,
) -> StreamResult<Vec<MessageId>> {
    let records = batch.take();
    if records.is_empty() {
        return Ok(Vec::new());
    }
    debug!(
        stream = %target.stream,
        queue = %target.queue,
        records = records.len(),
        "flushing batch"
    );
    match manager.publish_batch(target, records.clone()).await {
        Ok(ids) => Ok(ids),
        Err(err) => {
            batch.restore(records);
            Err(err)
        }
    }
}

async fn run_batcher(
    manager: StreamManager,
    target: PublishTarget,
    policy: FlushPolicy,
    mut receiver: mpsc::Receiver<Command>,
    failure: FailureSlot,
) -> StreamResult<usize> {
    let mut batch = Batch::new(policy);
    let mut published = 0usize;

    let record_outcome = |result: StreamResult<Vec<MessageId>>, published: &mut usize| {
        match result {
            Ok(ids) => {
                *published += ids.len();
            }
            Err(err) => {
                error!(stream = %target.stream, error = %err, "batch flush failed, records kept");
                *failure.lock() = Some(err);
            }
        }
    };

    loop {
        let deadline = batch.deadline();
        tokio::select! {
            command = receiver.recv() => match command {
                Some(Command::Record(record)) => {
                    batch.push(record);
                    if batch.is_full() {
                        let result = flush_batch(&manager, &target, &mut batch).await;
                        record_outcome(result, &mut published);
                    }
                }
                Some(Command::Flush(reply)) => {
                    let result = flush_batch(&manager, &target, &mut batch).await;
                    if let Ok(ids) = &result {
                        published += ids.len();
                    }
                    let _ = reply.send(result);
                }
                None => {
                    let ids = flush_batch(&manager, &target, &mut batch).await?;
                    published += ids.len();
                    break;
                }
            },
            () = async {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                let result = flush_batch(&manager, &target, &mut batch).await;
                record_outcome(result, &mut published);
            }
        }
    }

    Ok(published)
}
