//! Composition of server, plugin and app configuration layers.
//!
//! Layers are merged structurally first, in order: server, then plugins in
//! declaration order, then the app. Placeholders are resolved only after
//! every layer is in place, so an app may reference a plugin's events and
//! vice versa. The result is validated and every problem is reported at
//! once in [`ConfigError::Invalid`].
//!
//! Redefining a scalar at the same dotted path with a different value is a
//! conflict unless the layer that defined it listed the path (or one of its
//! parents) in `overridable_settings`. Server defaults are always
//! overridable.

use super::template::{
    substitute_os_env, substitute_os_env_map, ResolutionContext, TemplateResolver,
};
use super::{
    AppConfig, EngineConfig, EventConfig, EventDescriptor, EventType, ReadStreamDescriptor,
    ResolvedAppConfig, ResolvedAppIdentity, ServerConfig, WriteStreamDescriptor,
};
use crate::errors::{ConfigError, ConfigIssue, ConfigResult, RegistryError};
use crate::registry::EventRegistry;
use crate::types::{AppName, AppVersion, BatchSize, ConsumerGroup, EventName, QueueName, StreamName};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy)]
enum Overridable<'a> {
    All,
    Paths(&'a [String]),
}

impl Overridable<'_> {
    fn covers(&self, path: &str) -> bool {
        match self {
            Self::All => true,
            Self::Paths(paths) => paths.iter().any(|prefix| {
                path == prefix.as_str()
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('.'))
            }),
        }
    }
}

#[derive(Debug)]
struct Layer<'a> {
    label: String,
    env: &'a Map<String, Value>,
    settings: &'a Map<String, Value>,
    events: Option<&'a Map<String, Value>>,
    overridable: Overridable<'a>,
}

impl<'a> Layer<'a> {
    fn server(config: &'a ServerConfig) -> Self {
        Self {
            label: "server".to_string(),
            env: &config.env,
            settings: &config.settings,
            events: None,
            overridable: Overridable::All,
        }
    }

    fn app(config: &'a AppConfig, role: &str) -> Self {
        Self {
            label: format!("{role} '{}'", config.app.name),
            env: &config.env,
            settings: &config.settings,
            events: Some(&config.events),
            overridable: Overridable::Paths(&config.overridable_settings),
        }
    }
}

#[derive(Debug, Clone)]
struct Owner {
    layer: String,
    overridable: bool,
}

/// Structurally merged layers, before resolution.
#[derive(Debug, Default)]
struct MergedTree {
    env: Map<String, Value>,
    settings: Map<String, Value>,
    events: Map<String, Value>,
    owners: BTreeMap<String, Owner>,
    event_layers: BTreeMap<String, String>,
}

impl MergedTree {
    fn apply(&mut self, layer: &Layer<'_>, issues: &mut Vec<ConfigIssue>) {
        merge_map(&mut self.env, layer.env, "env", layer, &mut self.owners, issues);
        merge_map(
            &mut self.settings,
            layer.settings,
            "settings",
            layer,
            &mut self.owners,
            issues,
        );

        for (name, definition) in layer.events.into_iter().flatten() {
            if self.event_layers.contains_key(name) {
                match EventName::try_new(name.as_str()) {
                    Ok(event) => issues.push(RegistryError::DuplicateEvent(event).into()),
                    Err(_) => issues.push(ConfigIssue::schema(
                        format!("events.{name}"),
                        "invalid event name",
                    )),
                }
                continue;
            }
            self.event_layers.insert(name.clone(), layer.label.clone());
            self.events.insert(name.clone(), definition.clone());
        }
    }
}

fn join(prefix: &str, key: &str) -> String {
    format!("{prefix}.{key}")
}

fn owners_under<'o>(
    owners: &'o BTreeMap<String, Owner>,
    path: &'o str,
) -> impl Iterator<Item = &'o Owner> + 'o {
    owners
        .iter()
        .filter(move |(key, _)| {
            key.as_str() == path
                || key
                    .strip_prefix(path)
                    .is_some_and(|rest| rest.starts_with('.'))
        })
        .map(|(_, owner)| owner)
}

fn record_owners(
    value: &Value,
    path: &str,
    layer: &Layer<'_>,
    owners: &mut BTreeMap<String, Owner>,
) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                record_owners(child, &join(path, key), layer, owners);
            }
        }
        _ => {
            owners.insert(
                path.to_string(),
                Owner {
                    layer: layer.label.clone(),
                    overridable: layer.overridable.covers(path),
                },
            );
        }
    }
}

fn merge_map(
    target: &mut Map<String, Value>,
    source: &Map<String, Value>,
    prefix: &str,
    layer: &Layer<'_>,
    owners: &mut BTreeMap<String, Owner>,
    issues: &mut Vec<ConfigIssue>,
) {
    for (key, incoming) in source {
        let path = join(prefix, key);
        let Some(existing) = target.get_mut(key) else {
            record_owners(incoming, &path, layer, owners);
            target.insert(key.clone(), incoming.clone());
            continue;
        };

        if let (Value::Object(existing_map), Value::Object(incoming_map)) =
            (&mut *existing, incoming)
        {
            merge_map(existing_map, incoming_map, &path, layer, owners, issues);
            continue;
        }

        if *existing == *incoming {
            continue;
        }

        let blocking = owners_under(owners, &path).find(|owner| !owner.overridable).cloned();
        match blocking {
            Some(owner) => issues.push(ConfigIssue::Conflict {
                path,
                first_layer: owner.layer,
                second_layer: layer.label.clone(),
            }),
            None => {
                let stale: Vec<String> = owners
                    .keys()
                    .filter(|k| {
                        k.as_str() == path
                            || k
                                .strip_prefix(path.as_str())
                                .is_some_and(|rest| rest.starts_with('.'))
                    })
                    .cloned()
                    .collect();
                for k in stale {
                    owners.remove(&k);
                }
                record_owners(incoming, &path, layer, owners);
                *existing = incoming.clone();
            }
        }
    }
}

/// Builds a [`ResolvedAppConfig`] from configuration layers.
#[derive(Debug, Clone, Default)]
pub struct ConfigMerger {
    os_env: BTreeMap<String, String>,
}

impl ConfigMerger {
    /// A merger with an empty process environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// A merger that substitutes `${VAR}` from the given variables.
    pub const fn with_os_env(os_env: BTreeMap<String, String>) -> Self {
        Self { os_env }
    }

    /// A merger that captures the current process environment.
    pub fn from_process_env() -> Self {
        Self::with_os_env(std::env::vars().collect())
    }

    /// Merges, resolves and validates the layers of one application.
    #[instrument(
        skip_all,
        fields(app = %app.app.name, version = %app.app.version, plugins = plugins.len())
    )]
    pub fn merge(
        &self,
        server: &ServerConfig,
        plugins: &[AppConfig],
        app: &AppConfig,
    ) -> ConfigResult<ResolvedAppConfig> {
        let mut issues = Vec::new();
        let identity = check_identity(app, &mut issues);

        let mut tree = MergedTree::default();
        tree.apply(&Layer::server(server), &mut issues);
        for plugin in plugins {
            tree.apply(&Layer::app(plugin, "plugin"), &mut issues);
        }
        tree.apply(&Layer::app(app, "app"), &mut issues);
        check_plugins(app, plugins, &mut issues);
        debug!(
            events = tree.events.len(),
            settings = tree.settings.len(),
            conflicts = issues.len(),
            "layers merged"
        );

        let MergedTree {
            mut env,
            mut settings,
            mut events,
            ..
        } = tree;
        let mut engine = Value::Object(app.engine.clone());
        let mut unresolved = Vec::new();
        substitute_os_env_map(&mut env, &self.os_env, "env", &mut unresolved);
        substitute_os_env_map(&mut settings, &self.os_env, "settings", &mut unresolved);
        substitute_os_env_map(&mut events, &self.os_env, "events", &mut unresolved);
        substitute_os_env(&mut engine, &self.os_env, "engine", &mut unresolved);

        let context = ResolutionContext::new(app.app.name.as_str(), app.app.version.as_str())
            .with_env(env)
            .with_os_env(self.os_env.clone());
        let mut resolver = TemplateResolver::new(&context, events.keys().cloned());
        resolver.resolve_events(&events, &mut unresolved);
        let settings = resolver.resolve_settings(&settings, &mut unresolved);
        let engine = resolver
            .resolve_value(&engine, None, "engine")
            .unwrap_or_else(|error| {
                unresolved.push(error);
                Value::Object(Map::new())
            });
        let resolved_events = resolver.into_resolved_events();
        issues.extend(unresolved.into_iter().map(ConfigIssue::from));

        let engine = serde_json::from_value::<EngineConfig>(engine).unwrap_or_else(|error| {
            issues.push(ConfigIssue::schema("engine", error.to_string()));
            EngineConfig::default()
        });

        let descriptors: Vec<EventDescriptor> = resolved_events
            .iter()
            .filter_map(|(name, value)| {
                build_descriptor(name, value, &identity, &engine, &settings, &mut issues)
            })
            .collect();
        issues.extend(EventRegistry::conflicts(&descriptors).into_iter().map(ConfigIssue::from));

        if !issues.is_empty() {
            return Err(ConfigError::Invalid { issues });
        }

        Ok(ResolvedAppConfig {
            app: identity,
            plugins: app.plugins.clone(),
            engine,
            streams: server.streams.clone(),
            env: context.env,
            settings,
            enabled_groups: server.enabled_groups.clone(),
            events: descriptors
                .into_iter()
                .map(|descriptor| (descriptor.name.clone(), descriptor))
                .collect(),
        })
    }
}

/// Validated app identity. An invalid identity is reported and replaced by
/// a stand-in so the rest of the configuration is still checked.
fn check_identity(app: &AppConfig, issues: &mut Vec<ConfigIssue>) -> ResolvedAppIdentity {
    let name = AppName::try_new(app.app.name.as_str()).unwrap_or_else(|_| {
        issues.push(ConfigIssue::schema("app.name", "must be a non-empty name"));
        AppName::try_new("invalid-app").expect("'invalid-app' is a valid app name")
    });
    let version = AppVersion::try_new(app.app.version.as_str()).unwrap_or_else(|_| {
        issues.push(ConfigIssue::schema(
            "app.version",
            "must be dot separated alphanumeric parts, e.g. 0.1",
        ));
        AppVersion::try_new("0").expect("'0' is a valid app version")
    });
    ResolvedAppIdentity { name, version }
}

fn check_plugins(app: &AppConfig, plugins: &[AppConfig], issues: &mut Vec<ConfigIssue>) {
    for declared in &app.plugins {
        if !plugins.iter().any(|plugin| plugin.app == *declared) {
            issues.push(ConfigIssue::schema(
                "plugins",
                format!(
                    "plugin '{}' version '{}' is declared but no configuration was supplied",
                    declared.name, declared.version
                ),
            ));
        }
    }
    for supplied in plugins {
        if !app.plugins.contains(&supplied.app) {
            issues.push(ConfigIssue::schema(
                "plugins",
                format!(
                    "configuration supplied for plugin '{}' version '{}' \
                     which the app does not declare",
                    supplied.app.name, supplied.app.version
                ),
            ));
        }
    }
}

fn millis(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_millis(value))
}

fn parse_queues(raw: &[String], location: &str, issues: &mut Vec<ConfigIssue>) -> Vec<QueueName> {
    let mut queues: Vec<QueueName> = Vec::new();
    for queue in raw {
        match QueueName::try_new(queue.as_str()) {
            Ok(queue) if !queues.contains(&queue) => queues.push(queue),
            Ok(_) => {}
            Err(_) => issues.push(ConfigIssue::schema(
                location,
                format!("invalid queue name '{queue}'"),
            )),
        }
    }
    if queues.is_empty() {
        queues.push(QueueName::auto());
    }
    queues
}

fn parse_batch_size(
    raw: Option<usize>,
    location: &str,
    issues: &mut Vec<ConfigIssue>,
) -> BatchSize {
    raw.map_or_else(BatchSize::default_size, |size| {
        BatchSize::try_new(size).unwrap_or_else(|_| {
            issues.push(ConfigIssue::schema(
                location,
                format!("batch_size {size} is out of range"),
            ));
            BatchSize::default_size()
        })
    })
}

/// Validates one resolved event and fills its defaults.
fn build_descriptor(
    name: &str,
    value: &Value,
    app: &ResolvedAppIdentity,
    engine: &EngineConfig,
    settings: &Map<String, Value>,
    issues: &mut Vec<ConfigIssue>,
) -> Option<EventDescriptor> {
    let location = format!("events.{name}");
    let issues_before = issues.len();

    let Ok(event_name) = EventName::try_new(name) else {
        issues.push(ConfigIssue::schema(&location, "invalid event name"));
        return None;
    };
    let config = match serde_json::from_value::<EventConfig>(value.clone()) {
        Ok(config) => config,
        Err(error) => {
            issues.push(ConfigIssue::schema(&location, error.to_string()));
            return None;
        }
    };
    let event_type = config.event_type;

    if event_type == EventType::Stream && config.read_stream.is_none() {
        issues.push(ConfigIssue::schema(&location, "STREAM events must declare read_stream"));
    }
    if event_type != EventType::Stream && config.read_stream.is_some() {
        issues.push(ConfigIssue::schema(&location, "read_stream is only allowed on STREAM events"));
    }
    if event_type == EventType::Setup && config.write_stream.is_some() {
        issues.push(ConfigIssue::schema(&location, "SETUP events cannot declare write_stream"));
    }
    if !event_type.is_http() && config.route.is_some() {
        issues.push(ConfigIssue::schema(
            &location,
            "route is only allowed on GET, POST and MULTIPART events",
        ));
    }
    for key in &config.setting_keys {
        if !settings.contains_key(key) {
            issues.push(ConfigIssue::schema(
                &location,
                format!("setting key '{key}' not found in settings"),
            ));
        }
    }

    let route = event_type.is_http().then(|| {
        config.route.clone().unwrap_or_else(|| {
            format!("{}/{}/{}", app.name, app.version.route_version(), name.replace('.', "/"))
        })
    });

    let write_stream = config.write_stream.as_ref().and_then(|binding| {
        let location = format!("{location}.write_stream");
        let stream = StreamName::try_new(binding.name.as_str())
            .map_err(|_| issues.push(ConfigIssue::schema(&location, "invalid stream name")))
            .ok();
        let queues = parse_queues(&binding.queues, &location, issues);
        let batch_size = parse_batch_size(binding.batch_size, &location, issues);
        stream.map(|name| WriteStreamDescriptor {
            name,
            queues,
            queue_strategy: binding.queue_strategy,
            target_max_len: (binding.target_max_len > 0).then_some(binding.target_max_len),
            throttle: millis(binding.throttle_ms),
            batch_size,
        })
    });

    let read_stream = config.read_stream.as_ref().and_then(|binding| {
        let location = format!("{location}.read_stream");
        let stream = StreamName::try_new(binding.name.as_str())
            .map_err(|_| issues.push(ConfigIssue::schema(&location, "invalid stream name")))
            .ok();
        let group_name = binding
            .consumer_group
            .clone()
            .unwrap_or_else(|| format!("{}.{name}", app.app_key()));
        let group = ConsumerGroup::try_new(group_name)
            .map_err(|_| issues.push(ConfigIssue::schema(&location, "invalid consumer group")))
            .ok();
        let queues = parse_queues(&binding.queues, &location, issues);
        stream.zip(group).map(|(name, consumer_group)| ReadStreamDescriptor {
            name,
            consumer_group,
            queues,
        })
    });

    let read_batch_size =
        parse_batch_size(config.stream.batch_size, &format!("{location}.stream"), issues);

    if issues.len() > issues_before {
        return None;
    }

    Some(EventDescriptor {
        name: event_name,
        event_type,
        route,
        write_stream,
        read_stream,
        setting_keys: config.setting_keys,
        auth: config.auth,
        group: config.group,
        stream_timeout: config
            .stream
            .timeout_ms
            .or(engine.default_stream_timeout)
            .and_then(millis),
        response_timeout: config.response_timeout_ms.and_then(millis),
        read_batch_size,
    })
}
