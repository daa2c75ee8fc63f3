//! Error types for `eventline`.
//!
//! Each subsystem owns one error enum:
//!
//! - **TemplateError**: placeholder resolution failures (fatal at startup)
//! - **ConfigError**: merge and schema validation failures, aggregated so a
//!   configuration author sees every problem in one pass (fatal at startup)
//! - **RegistryError**: duplicate events or routes (fatal at startup)
//! - **StreamLogError**: failures reported by a durable log backend
//! - **StreamError**: producer/consumer protocol failures
//! - **StorageError**: failures reported by a persistence backend
//! - **DispatchError**: per-trigger execution failures, isolated to the
//!   triggering request or message

use crate::types::{ConsumerGroup, EventName, MessageId, QueueName, StreamName};
use miette::Diagnostic;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while expanding placeholders in configuration trees.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum TemplateError {
    /// A `{...}` reference points at nothing.
    #[error("unresolved reference '{{{reference}}}' at '{path}'")]
    #[diagnostic(code(eventline::template::unresolved))]
    Unresolved {
        /// The placeholder expression without braces
        reference: String,
        /// Dotted location of the string containing it
        path: String,
    },

    /// Event placeholders reference each other in a cycle.
    #[error("cyclic reference between events: {}", .events.join(" -> "))]
    #[diagnostic(
        code(eventline::template::cyclic_reference),
        help("an event may not depend, directly or transitively, on its own fields")
    )]
    CyclicReference {
        /// Events taking part in the cycle
        events: Vec<String>,
    },

    /// `{env.<path>}` names a key missing from the merged env section.
    #[error("missing env key '{key}' referenced at '{path}'")]
    #[diagnostic(code(eventline::template::missing_env_key))]
    MissingEnvKey {
        /// Dotted key inside the env section
        key: String,
        /// Dotted location of the string containing the reference
        path: String,
    },

    /// `${VAR}` names a process environment variable that is not set.
    #[error("cannot get value from OS environment var '{var}' referenced at '{path}'")]
    #[diagnostic(code(eventline::template::missing_os_var))]
    MissingOsVar {
        /// Variable name as written
        var: String,
        /// Dotted location of the string containing it
        path: String,
    },

    /// A reference resolves to a value that cannot be embedded in a string.
    #[error("reference '{{{reference}}}' at '{path}' embeds a non-scalar value in a string")]
    #[diagnostic(code(eventline::template::non_scalar))]
    NonScalar {
        /// The placeholder expression without braces
        reference: String,
        /// Dotted location of the string containing it
        path: String,
    },
}

/// Result type for template resolution.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// A single validation problem found while merging or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum ConfigIssue {
    /// Two layers define the same scalar at the same dotted path.
    #[error("conflicting definitions of '{path}' in {first_layer} and {second_layer}")]
    #[diagnostic(
        code(eventline::config::conflict),
        help("neither layer marks the key overridable")
    )]
    Conflict {
        /// Dotted path of the conflicting key
        path: String,
        /// Layer that defined it first
        first_layer: String,
        /// Layer that tried to redefine it
        second_layer: String,
    },

    /// An event or app section does not satisfy the schema.
    #[error("{location}: {message}")]
    #[diagnostic(code(eventline::config::schema))]
    Schema {
        /// Event name or section the problem belongs to
        location: String,
        /// Human readable description
        message: String,
    },

    /// Two events resolve to the same HTTP route and method.
    #[error(transparent)]
    #[diagnostic(code(eventline::config::duplicate_route))]
    Registry(#[from] RegistryError),

    /// A placeholder could not be resolved.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Template(#[from] TemplateError),
}

impl ConfigIssue {
    /// Creates a schema issue.
    pub fn schema(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            location: location.into(),
            message: message.into(),
        }
    }
}

/// Errors building a resolved application configuration.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    /// One or more merge, placeholder or validation issues; all are reported
    /// together and no partial configuration is produced.
    #[error("invalid configuration ({} issue(s)): {}", .issues.len(), format_issues(.issues))]
    #[diagnostic(code(eventline::config::invalid))]
    Invalid {
        /// Every problem found
        #[related]
        issues: Vec<ConfigIssue>,
    },

    /// A configuration file is not valid JSON for its schema.
    #[error("failed to parse config file '{path}': {source}")]
    #[diagnostic(code(eventline::config::parse))]
    Parse {
        /// File being parsed
        path: PathBuf,
        /// Underlying parse error
        #[source]
        source: serde_json::Error,
    },

    /// A configuration file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    #[diagnostic(code(eventline::config::io))]
    Io {
        /// File being read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Every issue of an [`ConfigError::Invalid`] error; empty otherwise.
    pub fn issues(&self) -> &[ConfigIssue] {
        match self {
            Self::Invalid { issues } => issues,
            Self::Parse { .. } | Self::Io { .. } => &[],
        }
    }
}

fn format_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors building the event registry.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum RegistryError {
    /// An event name was declared twice.
    #[error("duplicate event '{0}'")]
    DuplicateEvent(EventName),

    /// Two events share a route and method.
    #[error("duplicate route '{method} {route}' declared by '{first}' and '{second}'")]
    DuplicateRoute {
        /// HTTP method
        method: String,
        /// Route path
        route: String,
        /// First event declaring it
        first: EventName,
        /// Second event declaring it
        second: EventName,
    },
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors reported by a durable stream log backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamLogError {
    /// The backend cannot be reached; the operation may be retried.
    #[error("stream log unavailable: {0}")]
    Unavailable(String),

    /// The consumer group has not been registered on the stream.
    #[error("consumer group '{group}' not registered on stream '{stream}'")]
    GroupNotFound {
        /// Stream name
        stream: StreamName,
        /// Missing group
        group: ConsumerGroup,
    },

    /// Ack or release of a message the group does not hold as pending.
    #[error("message {msg_id} on '{stream}/{queue}' is not pending for group '{group}'")]
    NotPending {
        /// Stream name
        stream: StreamName,
        /// Queue of the message
        queue: QueueName,
        /// Consumer group
        group: ConsumerGroup,
        /// The message
        msg_id: MessageId,
    },

    /// Unexpected backend failure.
    #[error("stream log internal error: {0}")]
    Internal(String),
}

impl StreamLogError {
    /// Whether retrying the same call may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result type for stream log backends.
pub type StreamLogResult<T> = Result<T, StreamLogError>;

/// Errors of the stream producer/consumer protocol.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Publishing failed after exhausting retries.
    #[error("publish to stream '{stream}' failed after {attempts} attempt(s): {source}")]
    Publish {
        /// Target stream
        stream: StreamName,
        /// Attempts made
        attempts: u32,
        /// Last backend error
        #[source]
        source: StreamLogError,
    },

    /// A non-publish backend call failed.
    #[error(transparent)]
    Log(#[from] StreamLogError),

    /// A payload could not be serialized for size accounting.
    #[error("payload serialization failed: {0}")]
    Serialization(String),

    /// The batcher was closed and cannot accept more messages.
    #[error("batch publisher for stream '{0}' is closed")]
    BatcherClosed(StreamName),

    /// The backend kept failing and the circuit breaker rejected the call.
    #[error("stream log circuit is open, next attempt in {retry_in:?}")]
    CircuitOpen {
        /// Time left before the breaker lets a trial call through
        retry_in: Duration,
    },
}

/// Result type for stream protocol operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors reported by a persistence backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The key is not acceptable to the backend.
    #[error("invalid storage key '{0}'")]
    InvalidKey(String),

    /// Backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Result type for persistence backends.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised while dispatching a trigger to an event.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No event is registered under the name.
    #[error("event '{0}' not found")]
    EventNotFound(String),

    /// No event serves the route and method.
    #[error("no event serves '{method} {route}'")]
    RouteNotFound {
        /// HTTP method
        method: String,
        /// Requested route
        route: String,
    },

    /// The event type cannot be reached through this kind of trigger.
    #[error("event '{event}' of type {event_type} cannot be triggered by {trigger}")]
    NotTriggerable {
        /// Event name
        event: EventName,
        /// Declared type
        event_type: String,
        /// Trigger kind attempted
        trigger: &'static str,
    },

    /// No handler was registered for the event.
    #[error("no handler registered for event '{0}'")]
    HandlerMissing(EventName),

    /// The caller is not authorized; never retried.
    #[error("unauthorized for event '{event}': {reason}")]
    Unauthorized {
        /// Event name
        event: EventName,
        /// Reason reported by the authenticator
        reason: String,
    },

    /// A step of the event failed.
    #[error("step '{step}' of event '{event}' failed: {message}")]
    StepFailed {
        /// Event name
        event: EventName,
        /// Step name
        step: String,
        /// Failure description
        message: String,
    },

    /// Stream-triggered processing failed; the message was left unacknowledged.
    #[error("delivery of message {msg_id} on '{stream}' to event '{event}' failed: {source}")]
    DeliveryFailure {
        /// Event that handled the message
        event: EventName,
        /// Source stream
        stream: StreamName,
        /// Message id
        msg_id: MessageId,
        /// The failure
        #[source]
        source: Box<DispatchError>,
    },

    /// Execution exceeded its configured timeout.
    #[error("event '{event}' timed out after {timeout:?}")]
    Timeout {
        /// Event name
        event: EventName,
        /// Configured limit
        timeout: Duration,
    },

    /// Publishing the event output failed.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The event table could not be built.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl DispatchError {
    /// Whether the failure is a rejected authorization.
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

/// Result type for dispatching.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors raised while starting or stopping an [`crate::runtime::AppRuntime`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// `start` was called on a running runtime.
    #[error("runtime is already running")]
    AlreadyRunning,

    /// `stop` was called on a stopped runtime.
    #[error("runtime is not running")]
    NotRunning,

    /// A SETUP event failed or an event cannot be run.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// A background loop panicked or was cancelled.
    #[error("background task for event '{event}' failed: {message}")]
    Task {
        /// Event the loop served
        event: EventName,
        /// Join failure
        message: String,
    },
}

/// Result type for the app runtime.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
