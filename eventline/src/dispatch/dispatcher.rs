//! Routes triggers to event pipelines and publishes their outputs.

use super::context::EventContext;
use super::steps::{EventHandler, PipelineError, ServiceSource};
use crate::collaborators::{AuthRequest, Authenticator, Unsecured};
use crate::config::{EventDescriptor, EventType, ResolvedAppConfig};
use crate::errors::{DispatchError, DispatchResult};
use crate::monitoring::StructuredLogger;
use crate::registry::EventRegistry;
use crate::stream::{Envelope, PublishTarget, StreamManager, StreamMessage, StreamRecord};
use crate::types::{EventName, MessageId};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// An HTTP invocation, as handed over by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// `GET` or `POST`
    pub method: String,
    /// Request path
    pub route: String,
    /// Parsed request body, or query parameters for `GET`
    pub payload: Value,
    /// Request headers
    pub headers: BTreeMap<String, String>,
}

impl HttpRequest {
    /// A request without headers.
    pub fn new(method: impl Into<String>, route: impl Into<String>, payload: Value) -> Self {
        Self {
            method: method.into(),
            route: route.into(),
            payload,
            headers: BTreeMap::new(),
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// What starts an execution.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// An HTTP call
    Http(HttpRequest),
    /// A message delivered to a STREAM event's consumer group
    Stream {
        /// Receiving event
        event: EventName,
        /// Delivered message
        message: StreamMessage,
    },
}

/// Result of one successful execution.
#[derive(Debug, Clone, PartialEq)]
pub struct EventOutcome {
    /// Executed event
    pub event: EventName,
    /// Last payload produced, returned to HTTP callers
    pub result: Option<Value>,
    /// Every final payload, in production order
    pub outputs: Vec<Value>,
    /// Ids of the records published to the write stream
    pub published: Vec<MessageId>,
}

/// Builds a [`Dispatcher`].
pub struct DispatcherBuilder {
    app: Arc<ResolvedAppConfig>,
    streams: StreamManager,
    authenticator: Arc<dyn Authenticator>,
    handlers: Vec<(String, EventHandler)>,
    services: Vec<(String, Arc<dyn ServiceSource>)>,
    logger: StructuredLogger,
}

impl DispatcherBuilder {
    /// Replaces the default [`Unsecured`] authenticator.
    #[must_use]
    pub fn authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    /// Registers the steps of an event.
    #[must_use]
    pub fn handler(mut self, event: &str, handler: EventHandler) -> Self {
        self.handlers.push((event.to_string(), handler));
        self
    }

    /// Registers a SERVICE event: its payload source and its steps.
    #[must_use]
    pub fn service(
        mut self,
        event: &str,
        source: impl ServiceSource + 'static,
        handler: EventHandler,
    ) -> Self {
        self.services.push((event.to_string(), Arc::new(source)));
        self.handler(event, handler)
    }

    /// Replaces the structured logger.
    #[must_use]
    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Builds the immutable dispatch table.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::EventNotFound`] if a handler or service is
    /// registered for an undeclared event, [`DispatchError::NotTriggerable`]
    /// if a service source is attached to a non-SERVICE event, and
    /// [`DispatchError::Registry`] if the event table has conflicts.
    pub fn build(self) -> DispatchResult<Dispatcher> {
        let registry = EventRegistry::from_config(&self.app)?;

        let mut handlers = HashMap::with_capacity(self.handlers.len());
        for (name, handler) in self.handlers {
            let event = registry.get(&name).ok_or(DispatchError::EventNotFound(name))?;
            handlers.insert(event.name.clone(), handler);
        }

        let mut services = HashMap::with_capacity(self.services.len());
        for (name, source) in self.services {
            let event = registry.get(&name).ok_or(DispatchError::EventNotFound(name))?;
            if event.event_type != EventType::Service {
                return Err(DispatchError::NotTriggerable {
                    event: event.name.clone(),
                    event_type: event.event_type.to_string(),
                    trigger: "service source",
                });
            }
            services.insert(event.name.clone(), source);
        }

        Ok(Dispatcher {
            app: self.app,
            registry: Arc::new(registry),
            handlers,
            services,
            streams: self.streams,
            authenticator: self.authenticator,
            logger: self.logger,
        })
    }
}

/// Startup-built, immutable table from events to their pipelines.
pub struct Dispatcher {
    app: Arc<ResolvedAppConfig>,
    registry: Arc<EventRegistry>,
    handlers: HashMap<EventName, EventHandler>,
    services: HashMap<EventName, Arc<dyn ServiceSource>>,
    streams: StreamManager,
    authenticator: Arc<dyn Authenticator>,
    logger: StructuredLogger,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("app", &self.app.app.app_key())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Starts building a dispatcher for an app.
    pub fn builder(app: Arc<ResolvedAppConfig>, streams: StreamManager) -> DispatcherBuilder {
        DispatcherBuilder {
            app,
            streams,
            authenticator: Arc::new(Unsecured),
            handlers: Vec::new(),
            services: Vec::new(),
            logger: StructuredLogger::new("dispatcher"),
        }
    }

    /// The resolved configuration.
    pub fn app(&self) -> &Arc<ResolvedAppConfig> {
        &self.app
    }

    /// The event table.
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// The stream manager outputs are published through.
    pub const fn streams(&self) -> &StreamManager {
        &self.streams
    }

    /// The structured logger.
    pub const fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    /// Whether steps are registered for an event.
    pub fn handles(&self, event: &EventName) -> bool {
        self.handlers.contains_key(event)
    }

    /// The payload source of a SERVICE event.
    pub fn service_source(&self, event: &EventName) -> Option<&Arc<dyn ServiceSource>> {
        self.services.get(event)
    }

    /// A fresh context for an execution not triggered by a caller.
    pub fn context_for(&self, event: &EventDescriptor) -> EventContext {
        EventContext::new(Arc::clone(&self.app), event.clone(), &BTreeMap::new())
    }

    /// Executes a trigger.
    ///
    /// # Errors
    ///
    /// See [`Self::dispatch_http`] and [`Self::dispatch_stream`].
    pub async fn dispatch(&self, trigger: Trigger) -> DispatchResult<EventOutcome> {
        match trigger {
            Trigger::Http(request) => self.dispatch_http(request).await,
            Trigger::Stream { event, message } => self.dispatch_stream(&event, message).await,
        }
    }

    /// Executes the HTTP event serving the request's route.
    ///
    /// Events declaring `auth` methods are authenticated first. The whole
    /// execution, publishing included, is bounded by the event's response
    /// timeout.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::RouteNotFound`] when no HTTP event serves the route
    /// - [`DispatchError::Unauthorized`] when authentication is rejected
    /// - [`DispatchError::Timeout`] when the response timeout elapses
    /// - [`DispatchError::StepFailed`] or [`DispatchError::Stream`] when
    ///   the pipeline or publishing fails
    #[instrument(skip(self, request), fields(method = %request.method, route = %request.route))]
    pub async fn dispatch_http(&self, request: HttpRequest) -> DispatchResult<EventOutcome> {
        let HttpRequest {
            method,
            route,
            payload,
            headers,
        } = request;
        let event = self
            .registry
            .by_route(&method, &route)
            .cloned()
            .ok_or(DispatchError::RouteNotFound { method, route })?;
        let handler = self.handler(&event)?;

        let mut context = EventContext::new(Arc::clone(&self.app), event, &headers);
        if !context.event().auth.is_empty() {
            let principal = self
                .authenticator
                .authenticate(AuthRequest {
                    event: context.event_name(),
                    methods: &context.event().auth,
                    headers: &headers,
                })
                .await
                .map_err(|rejected| DispatchError::Unauthorized {
                    event: context.event_name().clone(),
                    reason: rejected.0,
                })?;
            context = context.with_principal(principal);
        }

        let timeout = context.event().response_timeout;
        self.execute_bounded(handler, &context, payload, None, timeout).await
    }

    /// Handles a message delivered to a STREAM event.
    ///
    /// On success the message is acknowledged. On any failure, timeout and
    /// a failed ack included, it is released for redelivery to the same
    /// group, so a claimed message never stays pending with this consumer.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::EventNotFound`] for an unknown event
    /// - [`DispatchError::NotTriggerable`] when the event is not STREAM
    /// - [`DispatchError::HandlerMissing`] when no handler is registered
    /// - [`DispatchError::DeliveryFailure`] wrapping the handling failure
    /// - [`DispatchError::Stream`] when the ack fails
    #[instrument(skip(self, message), fields(stream = %message.stream, msg_id = %message.msg_id))]
    pub async fn dispatch_stream(
        &self,
        event: &EventName,
        message: StreamMessage,
    ) -> DispatchResult<EventOutcome> {
        let (descriptor, handler) = match self.stream_handler(event) {
            Ok(found) => found,
            Err(error) => {
                self.release_for_redelivery(&message).await;
                return Err(error);
            }
        };

        let context = EventContext::for_message(Arc::clone(&self.app), descriptor, &message);
        let timeout = context.event().stream_timeout;
        let payload = message.payload.clone();
        match self
            .execute_bounded(handler, &context, payload, Some(&message), timeout)
            .await
        {
            Ok(outcome) => {
                if let Err(ack_error) = self.streams.ack(&message).await {
                    self.release_for_redelivery(&message).await;
                    return Err(ack_error.into());
                }
                Ok(outcome)
            }
            Err(error) => {
                self.release_for_redelivery(&message).await;
                Err(DispatchError::DeliveryFailure {
                    event: context.event_name().clone(),
                    stream: message.stream.clone(),
                    msg_id: message.msg_id,
                    source: Box::new(error),
                })
            }
        }
    }

    fn stream_handler(
        &self,
        event: &EventName,
    ) -> DispatchResult<(EventDescriptor, &EventHandler)> {
        let descriptor = self
            .registry
            .get(event.as_str())
            .cloned()
            .ok_or_else(|| DispatchError::EventNotFound(event.to_string()))?;
        if descriptor.event_type != EventType::Stream {
            return Err(DispatchError::NotTriggerable {
                event: descriptor.name,
                event_type: descriptor.event_type.to_string(),
                trigger: "stream message",
            });
        }
        let handler = self.handler(&descriptor)?;
        Ok((descriptor, handler))
    }

    async fn release_for_redelivery(&self, message: &StreamMessage) {
        if let Err(release_error) = self.streams.release(message).await {
            warn!(error = %release_error, "failed to release message for redelivery");
        }
    }

    /// Runs every effective SETUP event once, in name order.
    ///
    /// # Errors
    ///
    /// Returns the first failure; later SETUP events are not run.
    #[instrument(skip(self), fields(app = %self.app.app.app_key()))]
    pub async fn run_setup(&self) -> DispatchResult<Vec<EventOutcome>> {
        let setup: Vec<EventDescriptor> = self
            .registry
            .effective_events(&self.app.enabled_groups)
            .filter(|event| event.event_type == EventType::Setup)
            .cloned()
            .collect();

        let mut outcomes = Vec::with_capacity(setup.len());
        for event in setup {
            let handler = self.handler(&event)?;
            let context = self.context_for(&event);
            outcomes.push(self.execute(handler, &context, Value::Null, None).await?);
        }
        Ok(outcomes)
    }

    /// Runs a payload through an event's steps, without publishing.
    ///
    /// # Errors
    ///
    /// [`DispatchError::HandlerMissing`] or [`DispatchError::StepFailed`].
    pub async fn run_steps(
        &self,
        context: &EventContext,
        payload: Value,
    ) -> DispatchResult<Vec<Value>> {
        let handler = self.handler(context.event())?;
        Self::run_pipeline(handler, context, payload).await
    }

    /// Records for outputs of an execution, stamped with its envelope.
    pub fn records(context: &EventContext, outputs: &[Value]) -> Vec<StreamRecord> {
        outputs
            .iter()
            .map(|payload| StreamRecord {
                envelope: Envelope::new(context.event_ts(), context.track().clone())
                    .with_producer(context.event_name().clone())
                    .with_auth(context.principal().cloned()),
                payload: payload.clone(),
            })
            .collect()
    }

    /// Publishes outputs to the event's write stream, if it has one.
    ///
    /// Every configured queue receives every output, in appends of at most
    /// `batch_size` records.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Stream`] once publishing gives up.
    pub async fn publish_outputs(
        &self,
        context: &EventContext,
        outputs: &[Value],
    ) -> DispatchResult<Vec<MessageId>> {
        let Some(binding) = &context.event().write_stream else {
            return Ok(Vec::new());
        };
        if outputs.is_empty() {
            return Ok(Vec::new());
        }

        let targets =
            PublishTarget::from_binding(binding, context.event_name(), context.upstream_queue());
        let chunk_size = usize::from(binding.batch_size);
        let mut published = Vec::with_capacity(outputs.len() * targets.len());
        for target in &targets {
            for chunk in outputs.chunks(chunk_size) {
                let ids = self
                    .streams
                    .publish_batch(target, Self::records(context, chunk))
                    .await?;
                published.extend(ids);
            }
        }
        debug!(event = %context.event_name(), published = published.len(), "outputs published");
        Ok(published)
    }

    fn handler(&self, event: &EventDescriptor) -> DispatchResult<&EventHandler> {
        self.handlers
            .get(&event.name)
            .ok_or_else(|| DispatchError::HandlerMissing(event.name.clone()))
    }

    async fn run_pipeline(
        handler: &EventHandler,
        context: &EventContext,
        payload: Value,
    ) -> DispatchResult<Vec<Value>> {
        handler
            .run(payload, context)
            .await
            .map_err(|PipelineError { step, error }| DispatchError::StepFailed {
                event: context.event_name().clone(),
                step,
                message: error.message,
            })
    }

    async fn execute_bounded(
        &self,
        handler: &EventHandler,
        context: &EventContext,
        payload: Value,
        message: Option<&StreamMessage>,
        timeout: Option<Duration>,
    ) -> DispatchResult<EventOutcome> {
        let Some(limit) = timeout else {
            return self.execute(handler, context, payload, message).await;
        };
        let started = Instant::now();
        match tokio::time::timeout(limit, self.execute(handler, context, payload, message)).await {
            Ok(result) => result,
            Err(_) => {
                let error = DispatchError::Timeout {
                    event: context.event_name().clone(),
                    timeout: limit,
                };
                self.logger
                    .event_failed(context, message, &error, started.elapsed());
                Err(error)
            }
        }
    }

    async fn execute(
        &self,
        handler: &EventHandler,
        context: &EventContext,
        payload: Value,
        message: Option<&StreamMessage>,
    ) -> DispatchResult<EventOutcome> {
        let started = Instant::now();
        self.logger.event_start(context, message);

        let result = async {
            let outputs = Self::run_pipeline(handler, context, payload).await?;
            let published = self.publish_outputs(context, &outputs).await?;
            Ok::<_, DispatchError>((outputs, published))
        }
        .await;

        match result {
            Ok((outputs, published)) => {
                self.logger
                    .event_done(context, message, published.len(), started.elapsed());
                Ok(EventOutcome {
                    event: context.event_name().clone(),
                    result: outputs.last().cloned(),
                    outputs,
                    published,
                })
            }
            Err(error) => {
                self.logger
                    .event_failed(context, message, &error, started.elapsed());
                Err(error)
            }
        }
    }
}
