//! Structured event logging.
//!
//! Every entry is one JSON object emitted through `tracing`, carrying the
//! app key, the event name, the tracked correlation ids and, for stream
//! triggered executions, the envelope fields of the message.

use super::stats::StatsSnapshot;
use crate::config::LoggingConfig;
use crate::dispatch::EventContext;
use crate::stream::StreamMessage;
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// Log level enumeration for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Fine-grained detail
    Trace,
    /// Debugging detail
    Debug,
    /// Normal operation
    Info,
    /// Something unexpected, recovered
    Warn,
    /// A failure
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Lifecycle phase an entry reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLog {
    /// Execution started
    Start,
    /// Execution finished successfully
    Done,
    /// Execution failed
    Failed,
    /// Periodic throughput report
    Stats,
}

impl EventLog {
    /// Upper-case tag written to the `message` field.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Stats => "STATS",
        }
    }
}

impl fmt::Display for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured log entry with consistent format
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level
    pub level: LogLevel,
    /// Log message
    pub message: String,
    /// Timestamp of the log entry
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Component that generated the log
    pub component: String,
    /// App the entry belongs to
    pub app_key: Option<String>,
    /// Event the entry belongs to
    pub event_name: Option<String>,
    /// Structured fields
    pub fields: Map<String, Value>,
    /// Error information if applicable
    pub error: Option<String>,
    /// Duration information if applicable
    pub duration_ms: Option<u64>,
}

impl LogEntry {
    /// Creates a new log entry
    pub fn new(level: LogLevel, message: &str, component: &str) -> Self {
        Self {
            level,
            message: message.to_string(),
            timestamp: chrono::Utc::now(),
            component: component.to_string(),
            app_key: None,
            event_name: None,
            fields: Map::new(),
            error: None,
            duration_ms: None,
        }
    }

    /// Attributes the entry to an app and event.
    #[must_use]
    pub fn with_event(mut self, app_key: &str, event_name: &str) -> Self {
        self.app_key = Some(app_key.to_string());
        self.event_name = Some(event_name.to_string());
        self
    }

    /// Adds a field to the log entry
    #[must_use]
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    /// Adds every field of `fields`.
    #[must_use]
    pub fn with_fields(mut self, fields: Map<String, Value>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Adds error information
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Adds duration information
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    /// Converts to JSON for structured output
    pub fn to_json(&self) -> Value {
        let mut json_obj = json!({
            "level": format!("{:?}", self.level).to_lowercase(),
            "message": self.message,
            "timestamp": self.timestamp.to_rfc3339(),
            "component": self.component,
            "fields": self.fields
        });

        if let Some(app_key) = &self.app_key {
            json_obj["app_key"] = json!(app_key);
        }

        if let Some(event_name) = &self.event_name {
            json_obj["event_name"] = json!(event_name);
        }

        if let Some(error) = &self.error {
            json_obj["error"] = json!(error);
        }

        if let Some(duration_ms) = self.duration_ms {
            json_obj["duration_ms"] = json!(duration_ms);
        }

        json_obj
    }

    /// Logs the entry using tracing
    #[allow(clippy::cognitive_complexity)]
    pub fn log(&self) {
        let json_str = self.to_json().to_string();

        match self.level {
            LogLevel::Trace => tracing::trace!("{}", json_str),
            LogLevel::Debug => tracing::debug!("{}", json_str),
            LogLevel::Info => tracing::info!("{}", json_str),
            LogLevel::Warn => tracing::warn!("{}", json_str),
            LogLevel::Error => tracing::error!("{}", json_str),
        }
    }
}

/// Builds event lifecycle entries for one component.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    component: String,
    default_fields: Map<String, Value>,
}

impl StructuredLogger {
    /// Creates a new structured logger for a component
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            default_fields: Map::new(),
        }
    }

    /// Adds a default field that will be included in all log entries
    #[must_use]
    pub fn with_default_field(mut self, key: &str, value: Value) -> Self {
        self.default_fields.insert(key.to_string(), value);
        self
    }

    /// An entry with the default fields; not yet logged.
    pub fn entry(&self, level: LogLevel, message: &str) -> LogEntry {
        LogEntry::new(level, message, &self.component).with_fields(self.default_fields.clone())
    }

    fn event_entry(
        &self,
        level: LogLevel,
        phase: EventLog,
        context: &EventContext,
        message: Option<&StreamMessage>,
    ) -> LogEntry {
        let track: Map<String, Value> = context
            .track()
            .iter()
            .map(|(key, value)| (key.clone(), json!(value)))
            .collect();
        let mut entry = self
            .entry(level, phase.as_str())
            .with_event(&context.app_key(), context.event_name().as_str())
            .with_fields(track);
        if let Some(message) = message {
            entry = entry.with_fields(message.log_fields());
        }
        entry
    }

    /// Logs the start of an execution.
    pub fn event_start(&self, context: &EventContext, message: Option<&StreamMessage>) {
        self.event_entry(LogLevel::Info, EventLog::Start, context, message)
            .log();
    }

    /// Logs a successful execution.
    pub fn event_done(
        &self,
        context: &EventContext,
        message: Option<&StreamMessage>,
        published: usize,
        duration: Duration,
    ) {
        self.event_entry(LogLevel::Info, EventLog::Done, context, message)
            .with_field("published", json!(published))
            .with_duration(duration)
            .log();
    }

    /// Logs a failed execution.
    pub fn event_failed(
        &self,
        context: &EventContext,
        message: Option<&StreamMessage>,
        error: &dyn std::error::Error,
        duration: Duration,
    ) {
        self.event_entry(LogLevel::Error, EventLog::Failed, context, message)
            .with_error(&error.to_string())
            .with_duration(duration)
            .log();
    }

    /// Logs read-loop throughput.
    pub fn stream_stats(
        &self,
        app_key: &str,
        event_name: &str,
        stream: &str,
        stats: &StatsSnapshot,
    ) {
        let Value::Object(counts) = stats.to_json() else {
            return;
        };
        self.entry(LogLevel::Info, EventLog::Stats.as_str())
            .with_event(app_key, event_name)
            .with_field("stream.name", json!(stream))
            .with_fields(counts)
            .with_duration(stats.elapsed)
            .log();
    }
}

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `config.log_level`. Fails if a
/// subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let json_layer = config
        .json_format
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let text_layer =
        (!config.json_format).then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ConfigMerger, ServerConfig};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn context() -> EventContext {
        let mut config = AppConfig::new("demo", "1.0");
        let Value::Object(events) = json!({ "query": { "type": "GET" } }) else {
            unreachable!()
        };
        config.events = events;
        let app = Arc::new(
            ConfigMerger::new()
                .merge(&ServerConfig::default(), &[], &config)
                .unwrap(),
        );
        let event = app.event("query").unwrap().clone();
        EventContext::new(app, event, &BTreeMap::new())
    }

    #[test]
    fn entry_json_has_optional_fields_only_when_set() {
        let entry = LogEntry::new(LogLevel::Warn, "DONE", "dispatcher");
        let json = entry.to_json();
        assert_eq!(json["level"], "warn");
        assert!(json.get("error").is_none());
        assert!(json.get("app_key").is_none());

        let json = entry
            .with_event("demo.1x0", "query")
            .with_error("boom")
            .with_duration(Duration::from_millis(15))
            .to_json();
        assert_eq!(json["app_key"], "demo.1x0");
        assert_eq!(json["event_name"], "query");
        assert_eq!(json["error"], "boom");
        assert_eq!(json["duration_ms"], 15);
    }

    #[test]
    fn default_fields_are_included() {
        let logger = StructuredLogger::new("runtime").with_default_field("host", json!("a"));
        let entry = logger.entry(LogLevel::Info, "STATS");
        assert_eq!(entry.fields.get("host"), Some(&json!("a")));
        assert_eq!(entry.component, "runtime");
    }

    #[traced_test]
    #[test]
    fn lifecycle_entries_carry_event_and_track_fields() {
        let logger = StructuredLogger::new("dispatcher");
        let ctx = context();
        logger.event_start(&ctx, None);
        logger.event_done(&ctx, None, 2, Duration::from_millis(3));

        assert!(logs_contain("\"message\":\"START\""));
        assert!(logs_contain("\"message\":\"DONE\""));
        assert!(logs_contain("\"event_name\":\"query\""));
        assert!(logs_contain("\"app_key\":\"demo.1x0\""));
        assert!(logs_contain("track.operation_id"));
        assert!(logs_contain("\"published\":2"));
    }
}
