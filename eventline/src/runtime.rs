//! Application runtime: SETUP events, stream read loops and service loops.
//!
//! [`AppRuntime::start`] runs every effective SETUP event once, registers
//! the consumer group of every STREAM event and spawns one read loop per
//! STREAM event and one loop per SERVICE event. A group the backend cannot
//! register yet is retried by its read loop. [`AppRuntime::stop`] signals
//! every loop through a `watch` channel and joins them.

use crate::config::{EventDescriptor, EventType, ReadStreamDescriptor};
use crate::dispatch::{Dispatcher, ServiceSource};
use crate::errors::{DispatchError, RuntimeError, RuntimeResult, StreamError, StreamLogError};
use crate::monitoring::{StatsSnapshot, StreamStats};
use crate::stream::{BatchPublisher, FlushPolicy, PublishTarget};
use crate::types::EventName;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

struct Running {
    stop: watch::Sender<bool>,
    tasks: Vec<(EventName, JoinHandle<()>)>,
}

/// Runs the background side of one application.
pub struct AppRuntime {
    dispatcher: Arc<Dispatcher>,
    stats: Mutex<HashMap<EventName, Arc<StreamStats>>>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for AppRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppRuntime")
            .field("dispatcher", &self.dispatcher)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Random delay in `[0, max_seconds]` so replicas do not start in lockstep.
fn start_delay(max_seconds: u64) -> Duration {
    if max_seconds == 0 {
        return Duration::ZERO;
    }
    let max_ms = max_seconds.saturating_mul(1000);
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

/// How long a read loop waits after a failed backend call.
fn retry_delay(failure: &StreamError, read_interval: Duration) -> Duration {
    match failure {
        StreamError::CircuitOpen { retry_in } => (*retry_in).max(read_interval),
        _ => read_interval,
    }
}

/// Sleeps for `duration` unless stopped first; `false` when stopped.
async fn pause(stop: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if duration.is_zero() {
        return !*stop.borrow();
    }
    tokio::select! {
        changed = stop.changed() => changed.is_ok() && !*stop.borrow(),
        () = sleep(duration) => !*stop.borrow(),
    }
}

impl AppRuntime {
    /// Wraps a dispatcher.
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            stats: Mutex::new(HashMap::new()),
            running: Mutex::new(None),
        }
    }

    /// The dispatcher, for serving HTTP triggers alongside the loops.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Whether loops are running.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Read-loop counters of a STREAM event.
    pub fn stats(&self, event: &str) -> Option<StatsSnapshot> {
        let name = EventName::try_new(event).ok()?;
        self.stats.lock().get(&name).map(|stats| stats.snapshot())
    }

    fn effective(&self, event_type: EventType) -> Vec<EventDescriptor> {
        let app = self.dispatcher.app();
        self.dispatcher
            .registry()
            .effective_events(&app.enabled_groups)
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Runs SETUP events, then starts every read and service loop.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::AlreadyRunning`] if started twice
    /// - [`RuntimeError::Dispatch`] if a SETUP event fails, or a STREAM or
    ///   SERVICE event has no handler or service source
    ///
    /// A stream backend that is down does not fail `start`; read loops keep
    /// registering their group until it succeeds.
    #[instrument(skip(self), fields(app = %self.dispatcher.app().app.app_key()))]
    pub async fn start(&self) -> RuntimeResult<()> {
        if self.is_running() {
            return Err(RuntimeError::AlreadyRunning);
        }

        let setup = self.dispatcher.run_setup().await?;
        debug!(count = setup.len(), "setup events completed");

        let stream_events = self.effective(EventType::Stream);
        let service_events = self.effective(EventType::Service);

        let mut readers = Vec::with_capacity(stream_events.len());
        for event in stream_events {
            if !self.dispatcher.handles(&event.name) {
                return Err(DispatchError::HandlerMissing(event.name).into());
            }
            let Some(binding) = event.read_stream.clone() else {
                continue;
            };
            let registered = match self.dispatcher.streams().register_consumer(&binding).await {
                Ok(()) => true,
                Err(register_error) => {
                    warn!(
                        event = %event.name,
                        error = %register_error,
                        "consumer group not registered, read loop will retry"
                    );
                    false
                }
            };
            readers.push((event, binding, registered));
        }

        let mut services = Vec::with_capacity(service_events.len());
        for event in service_events {
            let source = self
                .dispatcher
                .service_source(&event.name)
                .cloned()
                .ok_or_else(|| DispatchError::HandlerMissing(event.name.clone()))?;
            services.push((event, source));
        }

        let (stop, receiver) = watch::channel(false);
        let max_delay = self.dispatcher.app().streams.delay_auto_start_seconds;
        let mut tasks = Vec::with_capacity(readers.len() + services.len());

        for (event, binding, registered) in readers {
            let stats = Arc::new(StreamStats::new());
            self.stats.lock().insert(event.name.clone(), Arc::clone(&stats));
            let name = event.name.clone();
            let task = tokio::spawn(read_loop(
                Arc::clone(&self.dispatcher),
                event,
                binding,
                registered,
                stats,
                receiver.clone(),
                start_delay(max_delay),
            ));
            tasks.push((name, task));
        }

        for (event, source) in services {
            let name = event.name.clone();
            let task = tokio::spawn(service_loop(
                Arc::clone(&self.dispatcher),
                event,
                source,
                receiver.clone(),
                start_delay(max_delay),
            ));
            tasks.push((name, task));
        }

        info!(loops = tasks.len(), "runtime started");
        *self.running.lock() = Some(Running { stop, tasks });
        Ok(())
    }

    /// Signals every loop to stop and waits for them.
    ///
    /// Read loops finish the batch they hold before stopping, so no claimed
    /// message is left unacknowledged.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::NotRunning`], or [`RuntimeError::Task`] for the first
    /// loop that panicked.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> RuntimeResult<()> {
        let Running { stop, tasks } = self.running.lock().take().ok_or(RuntimeError::NotRunning)?;
        let _ = stop.send(true);

        let (events, handles): (Vec<EventName>, Vec<JoinHandle<()>>) = tasks.into_iter().unzip();
        let results = join_all(handles).await;

        let mut first_failure = None;
        for (event, result) in events.into_iter().zip(results) {
            if let Err(join_error) = result {
                error!(event = %event, error = %join_error, "background loop failed");
                first_failure.get_or_insert(RuntimeError::Task {
                    event,
                    message: join_error.to_string(),
                });
            }
        }
        info!("runtime stopped");
        first_failure.map_or(Ok(()), Err)
    }
}

#[instrument(
    skip_all,
    fields(event = %event.name, stream = %binding.name, group = %binding.consumer_group)
)]
async fn read_loop(
    dispatcher: Arc<Dispatcher>,
    event: EventDescriptor,
    binding: ReadStreamDescriptor,
    mut registered: bool,
    stats: Arc<StreamStats>,
    mut stop: watch::Receiver<bool>,
    delay: Duration,
) {
    if !pause(&mut stop, delay).await {
        return;
    }
    let app_key = dispatcher.app().app.app_key();
    let read_timeout = dispatcher.app().engine.read_timeout();
    let read_interval = dispatcher.app().engine.read_interval();
    let count = usize::from(event.read_batch_size);
    debug!("read loop started");

    while !*stop.borrow() {
        if !registered {
            if let Err(register_error) = dispatcher.streams().register_consumer(&binding).await {
                warn!(error = %register_error, "consumer group registration failed");
                if pause(&mut stop, retry_delay(&register_error, read_interval)).await {
                    continue;
                }
                break;
            }
            registered = true;
        }

        let messages = match dispatcher.streams().read(&binding, count, read_timeout).await {
            Ok(messages) => messages,
            Err(read_error) => {
                if matches!(read_error, StreamError::CircuitOpen { .. }) {
                    debug!(error = %read_error, "stream read skipped");
                } else {
                    error!(error = %read_error, "stream read failed");
                }
                if matches!(read_error, StreamError::Log(StreamLogError::GroupNotFound { .. })) {
                    registered = false;
                }
                if pause(&mut stop, retry_delay(&read_error, read_interval)).await {
                    continue;
                }
                break;
            }
        };

        if messages.is_empty() {
            if !pause(&mut stop, read_interval).await {
                break;
            }
            continue;
        }

        let outcomes = join_all(
            messages
                .into_iter()
                .map(|message| dispatcher.dispatch_stream(&event.name, message)),
        )
        .await;
        for outcome in outcomes {
            match outcome {
                Ok(_) => stats.record_processed(),
                Err(failure) => {
                    stats.record_failed();
                    warn!(error = %failure, "message left for redelivery");
                }
            }
        }
        dispatcher.logger().stream_stats(
            &app_key,
            event.name.as_str(),
            &binding.name.to_string(),
            &stats.snapshot(),
        );
    }
    debug!("read loop stopped");
}

fn service_publishers(dispatcher: &Dispatcher, event: &EventDescriptor) -> Vec<BatchPublisher> {
    let Some(binding) = &event.write_stream else {
        return Vec::new();
    };
    let policy = FlushPolicy::from_config(&dispatcher.app().streams, binding.batch_size);
    PublishTarget::from_binding(binding, &event.name, None)
        .into_iter()
        .map(|target| dispatcher.streams().batch_publisher(target, policy))
        .collect()
}

#[instrument(skip_all, fields(event = %event.name))]
async fn service_loop(
    dispatcher: Arc<Dispatcher>,
    event: EventDescriptor,
    source: Arc<dyn ServiceSource>,
    mut stop: watch::Receiver<bool>,
    delay: Duration,
) {
    if !pause(&mut stop, delay).await {
        return;
    }
    let retry_interval = dispatcher.app().engine.read_interval();
    let publishers = service_publishers(&dispatcher, &event);
    debug!(publishers = publishers.len(), "service loop started");

    while !*stop.borrow() {
        let context = dispatcher.context_for(&event);
        let next = tokio::select! {
            _ = stop.changed() => break,
            next = source.next(&context) => next,
        };
        let payloads = match next {
            Ok(Some(payloads)) => payloads,
            Ok(None) => {
                debug!("service source exhausted");
                break;
            }
            Err(source_error) => {
                error!(error = %source_error, "service source failed");
                if pause(&mut stop, retry_interval).await {
                    continue;
                }
                break;
            }
        };

        let started = Instant::now();
        dispatcher.logger().event_start(&context, None);
        let mut produced = 0usize;
        let mut failure = None;
        'payloads: for payload in payloads {
            let outputs = match dispatcher.run_steps(&context, payload).await {
                Ok(outputs) => outputs,
                Err(step_error) => {
                    failure = Some(step_error);
                    break;
                }
            };
            for record in Dispatcher::records(&context, &outputs) {
                for publisher in &publishers {
                    if let Err(publish_error) = publisher.send(record.clone()).await {
                        failure = Some(publish_error.into());
                        break 'payloads;
                    }
                }
                produced += 1;
            }
        }
        if failure.is_none() {
            failure = publishers
                .iter()
                .find_map(BatchPublisher::take_failure)
                .map(Into::into);
        }
        match failure {
            None => dispatcher
                .logger()
                .event_done(&context, None, produced, started.elapsed()),
            Some(failure) => dispatcher
                .logger()
                .event_failed(&context, None, &failure, started.elapsed()),
        }
    }

    for publisher in publishers {
        match publisher.close().await {
            Ok(published) => debug!(published, "service publisher closed"),
            Err(close_error) => error!(error = %close_error, "service publisher failed"),
        }
    }
    debug!("service loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_delay_is_bounded() {
        assert_eq!(start_delay(0), Duration::ZERO);
        for _ in 0..50 {
            assert!(start_delay(2) <= Duration::from_secs(2));
        }
    }

    #[test]
    fn open_circuit_waits_at_least_its_backoff() {
        let interval = Duration::from_millis(50);
        let open = StreamError::CircuitOpen {
            retry_in: Duration::from_secs(2),
        };
        assert_eq!(retry_delay(&open, interval), Duration::from_secs(2));
        let closing = StreamError::CircuitOpen {
            retry_in: Duration::from_millis(1),
        };
        assert_eq!(retry_delay(&closing, interval), interval);
        let down = StreamError::Log(StreamLogError::Unavailable("down".into()));
        assert_eq!(retry_delay(&down, interval), interval);
    }

    #[tokio::test]
    async fn pause_returns_false_once_stopped() {
        let (stop, mut receiver) = watch::channel(false);
        assert!(pause(&mut receiver, Duration::from_millis(5)).await);

        let waiter =
            tokio::spawn(async move { pause(&mut receiver, Duration::from_secs(30)).await });
        stop.send(true).unwrap();
        assert!(!waiter.await.unwrap());
    }
}
