//! Layered application configuration.
//!
//! Configuration arrives as raw JSON layers: one [`ServerConfig`], the
//! [`AppConfig`] of every plugin the app depends on, and the app's own
//! [`AppConfig`]. The [`merge::ConfigMerger`] composes them, the
//! [`template`] resolver expands every placeholder, and the result is an
//! immutable [`ResolvedAppConfig`] shared read-only by every task.
//!
//! Templated sections (`engine`, `env`, `settings`, `events`) stay as JSON
//! until resolution so that placeholders may appear in any field,
//! including numeric ones (`"target_max_len": "{env.stream_len}"`).

pub mod loader;
pub mod merge;
pub mod template;

use crate::types::{AppName, AppVersion, BatchSize, ConsumerGroup, EventName, QueueName, StreamName};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub use loader::ConfigLoader;
pub use merge::ConfigMerger;

/// Name of the group every event belongs to unless declared otherwise.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Process-wide server configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Stream engine tunables
    pub streams: StreamsConfig,
    /// Log output configuration
    pub logging: LoggingConfig,
    /// Server-level env defaults, always overridable by plugins and apps
    pub env: Map<String, Value>,
    /// Server-level settings defaults, always overridable by plugins and apps
    pub settings: Map<String, Value>,
    /// Event groups this process runs; empty runs every group
    pub enabled_groups: Vec<String>,
}

/// Stream engine tunables shared by every app in the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    /// Upper bound of the random delay before read and service loops start
    pub delay_auto_start_seconds: u64,
    /// Batches are flushed after this many milliseconds
    pub flush_interval_ms: u64,
    /// Batches are flushed once their serialized size reaches this many bytes
    pub flush_max_size: usize,
    /// Publish attempts before a [`crate::errors::StreamError::Publish`] is surfaced
    pub publish_max_attempts: u32,
    /// First retry delay
    pub initial_backoff_ms: u64,
    /// Retry delay cap
    pub max_backoff_ms: u64,
    /// Consecutive read-side backend failures that open the circuit breaker
    pub num_failures_open_circuit_breaker: u32,
    /// Time the circuit stays open the first time
    pub circuit_initial_backoff_ms: u64,
    /// Cap for the circuit's doubling backoff
    pub circuit_max_backoff_ms: u64,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            delay_auto_start_seconds: 0,
            flush_interval_ms: 500,
            flush_max_size: 1024 * 1024,
            publish_max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            num_failures_open_circuit_breaker: 1,
            circuit_initial_backoff_ms: 1_000,
            circuit_max_backoff_ms: 60_000,
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub log_level: String,
    /// Emit JSON lines instead of human readable output
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Identity of an application or plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppIdentity {
    /// Application name
    pub name: String,
    /// Application version
    pub version: String,
}

/// Reference to a plugin an app depends on.
pub type PluginRef = AppIdentity;

/// One raw configuration layer, used both for plugins and for the app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Identity of the layer; never templated
    pub app: AppIdentity,
    /// Plugins in dependency order
    #[serde(default)]
    pub plugins: Vec<PluginRef>,
    /// Engine settings, deserialized into [`EngineConfig`] after resolution
    #[serde(default)]
    pub engine: Map<String, Value>,
    /// Environment section referenced through `{env.<path>}`
    #[serde(default)]
    pub env: Map<String, Value>,
    /// Settings keyed by event name or shared key
    #[serde(default)]
    pub settings: Map<String, Value>,
    /// Dotted paths (`settings.x.y`, `env.a`) later layers may redefine
    #[serde(default)]
    pub overridable_settings: Vec<String>,
    /// Event declarations keyed by event name, deserialized into
    /// [`EventConfig`] after resolution
    #[serde(default)]
    pub events: Map<String, Value>,
}

impl AppConfig {
    /// An empty layer with the given identity.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            app: AppIdentity {
                name: name.into(),
                version: version.into(),
            },
            plugins: Vec::new(),
            engine: Map::new(),
            env: Map::new(),
            settings: Map::new(),
            overridable_settings: Vec::new(),
            events: Map::new(),
        }
    }
}

/// Engine settings of an application, after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Correlation headers propagated end-to-end (`track.` prefix is implied)
    pub track_headers: Vec<String>,
    /// Allowed CORS origin, used by the external HTTP layer
    pub cors_origin: Option<String>,
    /// How long one stream read blocks waiting for data, in milliseconds
    pub read_stream_timeout: u64,
    /// Delay between polls when a read returns nothing, in milliseconds
    pub read_stream_interval: u64,
    /// Modules the external host loads handlers from
    pub import_modules: Vec<String>,
    /// Default processing timeout for stream messages, in milliseconds
    pub default_stream_timeout: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            track_headers: Vec::new(),
            cors_origin: None,
            read_stream_timeout: 1_000,
            read_stream_interval: 1_000,
            import_modules: Vec::new(),
            default_stream_timeout: None,
        }
    }
}

impl EngineConfig {
    /// `read_stream_timeout` as a [`Duration`].
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_stream_timeout)
    }

    /// `read_stream_interval` as a [`Duration`].
    pub const fn read_interval(&self) -> Duration {
        Duration::from_millis(self.read_stream_interval)
    }
}

/// How an event is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    /// HTTP GET
    Get,
    /// HTTP POST
    Post,
    /// HTTP multipart upload
    Multipart,
    /// Stream message delivery
    Stream,
    /// Internally scheduled producer
    Service,
    /// Run once at startup
    Setup,
}

impl EventType {
    /// Whether events of this type are reachable over HTTP.
    pub const fn is_http(self) -> bool {
        matches!(self, Self::Get | Self::Post | Self::Multipart)
    }

    /// HTTP method the event answers to, if any.
    pub const fn http_method(self) -> Option<&'static str> {
        match self {
            Self::Get => Some("GET"),
            Self::Post | Self::Multipart => Some("POST"),
            Self::Stream | Self::Service | Self::Setup => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Multipart => "MULTIPART",
            Self::Stream => "STREAM",
            Self::Service => "SERVICE",
            Self::Setup => "SETUP",
        };
        f.write_str(name)
    }
}

/// Queue tagging policy for write streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueStrategy {
    /// Output inherits the queue of the triggering message when the
    /// configured queue is `AUTO`
    #[default]
    Propagate,
    /// Output always uses the configured queues
    Drop,
}

/// Raw `write_stream` binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteStreamConfig {
    /// Target stream
    pub name: String,
    /// Queues each output is published to
    #[serde(default)]
    pub queues: Vec<String>,
    /// Queue tagging policy
    #[serde(default)]
    pub queue_strategy: QueueStrategy,
    /// Approximate retained length per queue; 0 means unbounded
    #[serde(default)]
    pub target_max_len: u64,
    /// Minimum interval between publishes from this producer, in milliseconds
    #[serde(default)]
    pub throttle_ms: u64,
    /// Messages coalesced into one append
    #[serde(default)]
    pub batch_size: Option<usize>,
}

/// Raw `read_stream` binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadStreamConfig {
    /// Source stream
    pub name: String,
    /// Consumer group; defaults to `<app>.<route_version>.<event>`
    #[serde(default)]
    pub consumer_group: Option<String>,
    /// Queues to subscribe; `AUTO` selects every queue on the stream
    #[serde(default)]
    pub queues: Vec<String>,
}

/// Per-event stream processing settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventStreamSettings {
    /// Processing timeout of one stream message, in milliseconds
    pub timeout_ms: Option<u64>,
    /// Messages claimed per read
    pub batch_size: Option<usize>,
}

/// Raw declaration of one event, after placeholder resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventConfig {
    /// Trigger type
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// HTTP route template
    #[serde(default)]
    pub route: Option<String>,
    /// Output stream binding
    #[serde(default)]
    pub write_stream: Option<WriteStreamConfig>,
    /// Input stream binding
    #[serde(default)]
    pub read_stream: Option<ReadStreamConfig>,
    /// Settings keys made available to the event
    #[serde(default)]
    pub setting_keys: Vec<String>,
    /// Required authorization methods
    #[serde(default)]
    pub auth: Vec<String>,
    /// Concurrency partitioning tag
    #[serde(default = "default_group")]
    pub group: String,
    /// Stream processing settings
    #[serde(default)]
    pub stream: EventStreamSettings,
    /// HTTP execution timeout, in milliseconds
    #[serde(default)]
    pub response_timeout_ms: Option<u64>,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

/// Resolved `write_stream` binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteStreamDescriptor {
    /// Target stream
    pub name: StreamName,
    /// Queues each output is published to; never empty
    pub queues: Vec<QueueName>,
    /// Queue tagging policy
    pub queue_strategy: QueueStrategy,
    /// Approximate retained length per queue; `None` is unbounded
    pub target_max_len: Option<u64>,
    /// Minimum interval between publishes from this producer
    pub throttle: Option<Duration>,
    /// Messages coalesced into one append
    pub batch_size: BatchSize,
}

/// Resolved `read_stream` binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadStreamDescriptor {
    /// Source stream
    pub name: StreamName,
    /// Consumer group
    pub consumer_group: ConsumerGroup,
    /// Queues in priority order; never empty
    pub queues: Vec<QueueName>,
}

/// A validated event declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventDescriptor {
    /// Unique event name
    pub name: EventName,
    /// Trigger type
    pub event_type: EventType,
    /// HTTP route; set for every HTTP event
    pub route: Option<String>,
    /// Output stream binding
    pub write_stream: Option<WriteStreamDescriptor>,
    /// Input stream binding; set for every STREAM event
    pub read_stream: Option<ReadStreamDescriptor>,
    /// Settings keys the event depends on, in declaration order
    pub setting_keys: Vec<String>,
    /// Required authorization methods
    pub auth: Vec<String>,
    /// Concurrency partitioning tag
    pub group: String,
    /// Processing timeout of one stream message
    pub stream_timeout: Option<Duration>,
    /// HTTP execution timeout
    pub response_timeout: Option<Duration>,
    /// Messages claimed per read
    pub read_batch_size: BatchSize,
}

impl EventDescriptor {
    /// HTTP method and route, for HTTP events.
    pub fn http_binding(&self) -> Option<(&'static str, &str)> {
        self.event_type.http_method().zip(self.route.as_deref())
    }
}

/// Validated identity of the running application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResolvedAppIdentity {
    /// Application name
    pub name: AppName,
    /// Application version
    pub version: AppVersion,
}

impl ResolvedAppIdentity {
    /// Key identifying the app in logs and defaults (`<name>.<route_version>`).
    pub fn app_key(&self) -> String {
        format!("{}.{}", self.name, self.version.route_version())
    }
}

/// Immutable, fully dereferenced configuration of one application.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedAppConfig {
    /// App identity
    pub app: ResolvedAppIdentity,
    /// Plugin dependencies in declaration order
    pub plugins: Vec<PluginRef>,
    /// Engine settings
    pub engine: EngineConfig,
    /// Stream engine tunables from the server layer
    pub streams: StreamsConfig,
    /// Merged env section
    pub env: Map<String, Value>,
    /// Merged settings keyed by event name or shared key
    pub settings: Map<String, Value>,
    /// Event groups this process runs
    pub enabled_groups: Vec<String>,
    /// Every event, keyed by name
    pub events: BTreeMap<EventName, EventDescriptor>,
}

impl ResolvedAppConfig {
    /// Looks up an event by name.
    pub fn event(&self, name: &str) -> Option<&EventDescriptor> {
        EventName::try_new(name)
            .ok()
            .and_then(|name| self.events.get(&name))
    }

    /// Settings value stored under `key`.
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }
}

impl From<&ResolvedAppConfig> for AppConfig {
    /// Turns a resolved configuration back into a raw layer, so a resolved
    /// plugin can be merged into an app.
    fn from(resolved: &ResolvedAppConfig) -> Self {
        let events = resolved
            .events
            .iter()
            .filter_map(|(name, descriptor)| {
                serde_json::to_value(EventConfig::from(descriptor))
                    .ok()
                    .map(|value| (name.to_string(), value))
            })
            .collect();
        let engine = match serde_json::to_value(&resolved.engine) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Self {
            app: AppIdentity {
                name: resolved.app.name.to_string(),
                version: resolved.app.version.to_string(),
            },
            plugins: resolved.plugins.clone(),
            engine,
            env: resolved.env.clone(),
            settings: resolved.settings.clone(),
            overridable_settings: Vec::new(),
            events,
        }
    }
}

impl From<&EventDescriptor> for EventConfig {
    fn from(descriptor: &EventDescriptor) -> Self {
        Self {
            event_type: descriptor.event_type,
            route: descriptor.route.clone(),
            write_stream: descriptor.write_stream.as_ref().map(|ws| WriteStreamConfig {
                name: ws.name.to_string(),
                queues: ws.queues.iter().map(ToString::to_string).collect(),
                queue_strategy: ws.queue_strategy,
                target_max_len: ws.target_max_len.unwrap_or(0),
                throttle_ms: ws
                    .throttle
                    .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                batch_size: Some(ws.batch_size.into()),
            }),
            read_stream: descriptor.read_stream.as_ref().map(|rs| ReadStreamConfig {
                name: rs.name.to_string(),
                consumer_group: Some(rs.consumer_group.to_string()),
                queues: rs.queues.iter().map(ToString::to_string).collect(),
            }),
            setting_keys: descriptor.setting_keys.clone(),
            auth: descriptor.auth.clone(),
            group: descriptor.group.clone(),
            stream: EventStreamSettings {
                timeout_ms: descriptor
                    .stream_timeout
                    .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                batch_size: Some(descriptor.read_batch_size.into()),
            },
            response_timeout_ms: descriptor
                .response_timeout
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_config_applies_defaults() {
        let config: EventConfig = serde_json::from_value(json!({
            "type": "STREAM",
            "read_stream": { "name": "orders" }
        }))
        .unwrap();

        assert_eq!(config.event_type, EventType::Stream);
        assert_eq!(config.group, DEFAULT_GROUP);
        assert!(config.read_stream.unwrap().queues.is_empty());
        assert!(config.setting_keys.is_empty());
    }

    #[test]
    fn event_config_rejects_unknown_fields() {
        let result = serde_json::from_value::<EventConfig>(json!({
            "type": "GET",
            "rout": "typo"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn write_stream_parses_queue_strategy() {
        let config: WriteStreamConfig = serde_json::from_value(json!({
            "name": "out",
            "queues": ["AUTO"],
            "queue_strategy": "DROP",
            "target_max_len": 10
        }))
        .unwrap();
        assert_eq!(config.queue_strategy, QueueStrategy::Drop);
        assert_eq!(config.target_max_len, 10);
        assert_eq!(config.throttle_ms, 0);
    }

    #[test]
    fn server_config_defaults() {
        let config: ServerConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config.streams.flush_interval_ms, 500);
        assert_eq!(config.streams.flush_max_size, 1024 * 1024);
        assert_eq!(config.streams.publish_max_attempts, 3);
        assert_eq!(config.streams.num_failures_open_circuit_breaker, 1);
        assert_eq!(config.streams.circuit_max_backoff_ms, 60_000);
        assert_eq!(config.logging.log_level, "info");
    }

    #[test]
    fn http_methods() {
        assert_eq!(EventType::Get.http_method(), Some("GET"));
        assert_eq!(EventType::Multipart.http_method(), Some("POST"));
        assert_eq!(EventType::Stream.http_method(), None);
        assert!(!EventType::Setup.is_http());
    }
}
