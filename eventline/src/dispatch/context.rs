//! Execution context handed to every step of an event.

use crate::collaborators::Principal;
use crate::config::{EventDescriptor, ResolvedAppConfig};
use crate::stream::StreamMessage;
use crate::types::{EventName, QueueName, Timestamp};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Prefix of every tracked correlation key.
pub const TRACK_PREFIX: &str = "track.";
/// Identifier of the whole operation, shared by chained events.
pub const TRACK_OPERATION_ID: &str = "track.operation_id";
/// Identifier of this request, new for every execution.
pub const TRACK_REQUEST_ID: &str = "track.request_id";
/// When the operation started.
pub const TRACK_REQUEST_TS: &str = "track.request_ts";

/// Normalizes a header name to its `track.` key, if it is a tracked header.
///
/// Accepts `track.session_id` and `X-Track-Session-Id` forms.
fn track_key(header: &str) -> Option<String> {
    let lower = header.to_ascii_lowercase();
    if let Some(name) = lower.strip_prefix(TRACK_PREFIX) {
        return Some(format!("{TRACK_PREFIX}{name}"));
    }
    lower
        .strip_prefix("x-track-")
        .map(|name| format!("{TRACK_PREFIX}{}", name.replace('-', "_")))
}

/// Everything a step may read about the current execution.
#[derive(Debug, Clone)]
pub struct EventContext {
    app: Arc<ResolvedAppConfig>,
    event: EventDescriptor,
    track: BTreeMap<String, String>,
    settings: Map<String, Value>,
    principal: Option<Principal>,
    event_ts: Timestamp,
    upstream_queue: Option<QueueName>,
    delivery_count: Option<u32>,
}

impl EventContext {
    /// A context for an execution with the given incoming correlation values.
    ///
    /// Only headers named in the app's `track_headers`, plus the built-in
    /// operation and request ids, are kept. Missing ids are generated.
    pub fn new(
        app: Arc<ResolvedAppConfig>,
        event: EventDescriptor,
        headers: &BTreeMap<String, String>,
    ) -> Self {
        let mut allowed: Vec<String> = app
            .engine
            .track_headers
            .iter()
            .map(|header| track_key(header).unwrap_or_else(|| format!("{TRACK_PREFIX}{header}")))
            .collect();
        allowed.extend([TRACK_OPERATION_ID.to_string(), TRACK_REQUEST_TS.to_string()]);

        let mut track: BTreeMap<String, String> = headers
            .iter()
            .filter_map(|(header, value)| track_key(header).map(|key| (key, value.clone())))
            .filter(|(key, _)| allowed.contains(key))
            .collect();

        let now = Timestamp::now();
        track
            .entry(TRACK_OPERATION_ID.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string());
        track
            .entry(TRACK_REQUEST_TS.to_string())
            .or_insert_with(|| now.to_rfc3339());
        track.insert(TRACK_REQUEST_ID.to_string(), Uuid::new_v4().to_string());

        let settings = Self::collect_settings(&app, &event);
        Self {
            app,
            event,
            track,
            settings,
            principal: None,
            event_ts: now,
            upstream_queue: None,
            delivery_count: None,
        }
    }

    /// A context for handling a stream message; correlation ids and the
    /// authenticated caller of the producer are carried over.
    pub fn for_message(
        app: Arc<ResolvedAppConfig>,
        event: EventDescriptor,
        message: &StreamMessage,
    ) -> Self {
        let mut context = Self::new(app, event, &message.track);
        context.upstream_queue = Some(message.queue.clone());
        context.delivery_count = Some(message.delivery_count);
        context.principal.clone_from(&message.auth);
        context
    }

    fn collect_settings(app: &ResolvedAppConfig, event: &EventDescriptor) -> Map<String, Value> {
        let own: &str = event.name.as_ref();
        std::iter::once(own)
            .chain(event.setting_keys.iter().map(String::as_str))
            .filter_map(|key| app.settings.get(key).map(|value| (key.to_string(), value.clone())))
            .collect()
    }

    /// Attaches the authenticated principal.
    #[must_use]
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    /// The application configuration.
    pub fn app(&self) -> &ResolvedAppConfig {
        &self.app
    }

    /// Key identifying the app in logs.
    pub fn app_key(&self) -> String {
        self.app.app.app_key()
    }

    /// The executing event.
    pub const fn event(&self) -> &EventDescriptor {
        &self.event
    }

    /// Name of the executing event.
    pub const fn event_name(&self) -> &EventName {
        &self.event.name
    }

    /// Tracked correlation values.
    pub const fn track(&self) -> &BTreeMap<String, String> {
        &self.track
    }

    /// One tracked value, by full key (`track.session_id`).
    pub fn track_value(&self, key: &str) -> Option<&str> {
        self.track.get(key).map(String::as_str)
    }

    /// Settings available to the event: its own entry and its `setting_keys`.
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    /// The event's own settings entry.
    pub fn event_settings(&self) -> Option<&Value> {
        self.settings.get(self.event.name.as_str())
    }

    /// Deserializes a settings entry.
    pub fn setting_as<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Option<Result<T, serde_json::Error>> {
        self.settings.get(key).cloned().map(serde_json::from_value)
    }

    /// The authenticated caller, if any.
    pub const fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// When this execution started.
    pub const fn event_ts(&self) -> Timestamp {
        self.event_ts
    }

    /// Queue of the triggering message, for stream-triggered executions.
    pub const fn upstream_queue(&self) -> Option<&QueueName> {
        self.upstream_queue.as_ref()
    }

    /// How many times the triggering message has been delivered, 1 on the
    /// first delivery.
    pub const fn delivery_count(&self) -> Option<u32> {
        self.delivery_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ConfigMerger, ServerConfig};
    use serde_json::json;

    fn app() -> Arc<ResolvedAppConfig> {
        let mut config = AppConfig::new("demo", "1.0");
        let Value::Object(engine) = json!({ "track_headers": ["caller", "session_id"] }) else {
            unreachable!()
        };
        config.engine = engine;
        let Value::Object(settings) = json!({
            "save": { "path": "/data" },
            "shared": { "retries": 3 },
            "unrelated": true
        }) else {
            unreachable!()
        };
        config.settings = settings;
        let Value::Object(events) = json!({
            "save": { "type": "POST", "setting_keys": ["shared"] }
        }) else {
            unreachable!()
        };
        config.events = events;
        Arc::new(ConfigMerger::new().merge(&ServerConfig::default(), &[], &config).unwrap())
    }

    fn context(headers: &BTreeMap<String, String>) -> EventContext {
        let app = app();
        let event = app.event("save").unwrap().clone();
        EventContext::new(app, event, headers)
    }

    #[test]
    fn tracked_headers_are_normalized_and_filtered() {
        let headers: BTreeMap<String, String> = [
            ("X-Track-Session-Id".to_string(), "s-1".to_string()),
            ("track.caller".to_string(), "tests".to_string()),
            ("x-track-secret".to_string(), "nope".to_string()),
            ("authorization".to_string(), "Bearer x".to_string()),
        ]
        .into();
        let ctx = context(&headers);

        assert_eq!(ctx.track_value("track.session_id"), Some("s-1"));
        assert_eq!(ctx.track_value("track.caller"), Some("tests"));
        assert!(ctx.track_value("track.secret").is_none());
        assert!(ctx.track_value(TRACK_OPERATION_ID).is_some());
        assert!(ctx.track_value(TRACK_REQUEST_ID).is_some());
        assert!(ctx.track_value(TRACK_REQUEST_TS).is_some());
    }

    #[test]
    fn operation_id_is_propagated_request_id_is_new() {
        let headers: BTreeMap<String, String> = [
            (TRACK_OPERATION_ID.to_string(), "op-1".to_string()),
            (TRACK_REQUEST_ID.to_string(), "req-upstream".to_string()),
        ]
        .into();
        let ctx = context(&headers);
        assert_eq!(ctx.track_value(TRACK_OPERATION_ID), Some("op-1"));
        assert_ne!(ctx.track_value(TRACK_REQUEST_ID), Some("req-upstream"));
    }

    #[test]
    fn settings_are_scoped_to_event_and_keys() {
        let ctx = context(&BTreeMap::new());
        assert_eq!(ctx.event_settings(), Some(&json!({ "path": "/data" })));
        assert_eq!(ctx.setting("shared"), Some(&json!({ "retries": 3 })));
        assert!(ctx.setting("unrelated").is_none());

        #[derive(serde::Deserialize)]
        struct Shared {
            retries: u32,
        }
        let shared: Shared = ctx.setting_as("shared").unwrap().unwrap();
        assert_eq!(shared.retries, 3);
    }

    #[test]
    fn message_context_restores_producer_caller() {
        use crate::stream::{Envelope, StreamEntry, StreamRecord};
        use crate::types::{ConsumerGroup, MessageId, StreamName};

        let principal = Principal {
            id: "user-1".to_string(),
            method: "BEARER".to_string(),
            claims: Map::new(),
        };
        let track: BTreeMap<String, String> =
            [(TRACK_OPERATION_ID.to_string(), "op-9".to_string())].into();
        let entry = StreamEntry {
            msg_id: MessageId::new(1, 0),
            queue: QueueName::auto(),
            record: StreamRecord {
                envelope: Envelope::new(Timestamp::now(), track).with_auth(Some(principal.clone())),
                payload: json!({}),
            },
            delivery_count: 1,
        };
        let message = StreamMessage::delivered(
            &StreamName::try_new("saved").unwrap(),
            &ConsumerGroup::try_new("g1").unwrap(),
            entry,
        );

        let app = app();
        let event = app.event("save").unwrap().clone();
        let ctx = EventContext::for_message(app, event, &message);
        assert_eq!(ctx.principal(), Some(&principal));
        assert_eq!(ctx.track_value(TRACK_OPERATION_ID), Some("op-9"));
        assert_eq!(ctx.upstream_queue(), Some(&QueueName::auto()));
        assert_eq!(ctx.delivery_count(), Some(1));
        assert!(context(&BTreeMap::new()).delivery_count().is_none());
    }
}
