//! Placeholder resolution for configuration trees.
//!
//! Two kinds of expressions are expanded inside string values:
//!
//! - `${VAR}`: replaced from the process environment (variable name
//!   upper-cased) before anything else.
//! - `{...}`: references to other configuration values:
//!   - `{env.<path>}` looks up the merged env section
//!   - `{events.<event>.<path>}` looks up another event's resolved fields
//!   - `{app.name}`, `{app.version}`, `{app.route_version}`
//!   - `{auto}` expands to the short name of the event (or settings key)
//!     being resolved
//!
//! Any other brace expression, such as a route parameter `{id}`, is left
//! untouched. A string consisting of exactly one reference takes the
//! referenced value with its JSON type, so numeric fields can be templated.
//!
//! Events are resolved in dependency order. Resolution does not stop at
//! the first failure: every failure is pushed to an error list so the whole
//! configuration is checked in one pass. Events on a reference cycle are
//! reported once as [`TemplateError::CyclicReference`] and left unresolved.

use crate::errors::{TemplateError, TemplateResult};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

const ENV_PREFIX: &str = "env.";
const EVENTS_PREFIX: &str = "events.";
const APP_PREFIX: &str = "app.";
const AUTO: &str = "auto";

/// Inputs shared by every resolution within one application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionContext {
    /// Application name for `{app.name}`
    pub app_name: String,
    /// Application version for `{app.version}`
    pub app_version: String,
    /// Merged env section for `{env.<path>}`
    pub env: Map<String, Value>,
    /// Captured process environment for `${VAR}`
    pub os_env: BTreeMap<String, String>,
}

impl ResolutionContext {
    /// Creates a context for the given app identity.
    pub fn new(app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            ..Self::default()
        }
    }

    /// Sets the env section.
    #[must_use]
    pub fn with_env(mut self, env: Map<String, Value>) -> Self {
        self.env = env;
        self
    }

    /// Sets the captured process environment.
    #[must_use]
    pub fn with_os_env(mut self, os_env: BTreeMap<String, String>) -> Self {
        self.os_env = os_env;
        self
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Reference(&'a str),
}

fn is_reference(expr: &str) -> bool {
    expr == AUTO
        || [ENV_PREFIX, EVENTS_PREFIX, APP_PREFIX]
            .iter()
            .any(|prefix| expr.len() > prefix.len() && expr.starts_with(prefix))
}

/// Splits a string into literal text and `{...}` references.
fn segments(text: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut literal_start = 0;
    let mut cursor = 0;

    while let Some(open) = text[cursor..].find('{').map(|i| cursor + i) {
        let Some(close) = text[open + 1..].find('}').map(|i| open + 1 + i) else {
            break;
        };
        let inner = &text[open + 1..close];
        if let Some(nested) = inner.rfind('{') {
            cursor = open + 1 + nested;
            continue;
        }
        if is_reference(inner) {
            if open > literal_start {
                out.push(Segment::Literal(&text[literal_start..open]));
            }
            out.push(Segment::Reference(inner));
            literal_start = close + 1;
        }
        cursor = close + 1;
    }

    if literal_start < text.len() {
        out.push(Segment::Literal(&text[literal_start..]));
    }
    out
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Navigates a dotted path through objects and arrays.
pub fn get_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |node, key| match node {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Navigates a dotted path starting at a map.
pub fn get_map_path<'v>(map: &'v Map<String, Value>, path: &str) -> Option<&'v Value> {
    let (head, rest) = path.split_once('.').unwrap_or((path, ""));
    map.get(head).and_then(|value| get_path(value, rest))
}

/// Replaces every `${VAR}` in string values from `os_env`.
///
/// Unset variables are left as written and reported to `errors`.
pub fn substitute_os_env(
    value: &mut Value,
    os_env: &BTreeMap<String, String>,
    path: &str,
    errors: &mut Vec<TemplateError>,
) {
    match value {
        Value::String(text) => {
            if text.contains("${") {
                *text = substitute_os_env_str(text, os_env, path, errors);
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                substitute_os_env(item, os_env, &join_path(path, &i.to_string()), errors);
            }
        }
        Value::Object(map) => substitute_os_env_map(map, os_env, path, errors),
        _ => {}
    }
}

/// Replaces every `${VAR}` in the values of a map.
pub fn substitute_os_env_map(
    map: &mut Map<String, Value>,
    os_env: &BTreeMap<String, String>,
    path: &str,
    errors: &mut Vec<TemplateError>,
) {
    for (key, item) in map.iter_mut() {
        substitute_os_env(item, os_env, &join_path(path, key), errors);
    }
}

fn substitute_os_env_str(
    text: &str,
    os_env: &BTreeMap<String, String>,
    path: &str,
    errors: &mut Vec<TemplateError>,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        let var = &after[..end];
        if var.is_empty() || var.contains('{') {
            out.push_str(&rest[..start + 2]);
            rest = after;
            continue;
        }
        match os_env.get(&var.to_uppercase()) {
            Some(value) => {
                out.push_str(&rest[..start]);
                out.push_str(value);
            }
            None => {
                errors.push(TemplateError::MissingOsVar {
                    var: var.to_string(),
                    path: path.to_string(),
                });
                out.push_str(&rest[..start + 2 + end + 1]);
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Resolves placeholders against a context and a set of already-resolved events.
#[derive(Debug)]
pub struct TemplateResolver<'a> {
    context: &'a ResolutionContext,
    event_names: BTreeSet<String>,
    resolved_events: Map<String, Value>,
}

impl<'a> TemplateResolver<'a> {
    /// Creates a resolver aware of the given event names.
    pub fn new<I, S>(context: &'a ResolutionContext, event_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            context,
            event_names: event_names.into_iter().map(Into::into).collect(),
            resolved_events: Map::new(),
        }
    }

    /// Events resolved so far.
    pub const fn resolved_events(&self) -> &Map<String, Value> {
        &self.resolved_events
    }

    /// Consumes the resolver, returning the resolved events.
    pub fn into_resolved_events(self) -> Map<String, Value> {
        self.resolved_events
    }

    /// Resolves every event it can, in dependency order.
    ///
    /// Each failure is pushed to `errors`. An event that depends on a failed
    /// event is skipped without a report of its own, and the events of a
    /// reference cycle are reported once.
    pub fn resolve_events(
        &mut self,
        raw_events: &Map<String, Value>,
        errors: &mut Vec<TemplateError>,
    ) {
        let EventOrder { order, cycle } = event_order(raw_events, &self.event_names);
        let mut failed: BTreeSet<String> = BTreeSet::new();
        for name in order {
            let Some(raw) = raw_events.get(&name) else {
                continue;
            };
            let mut refs = BTreeSet::new();
            collect_event_refs(raw, &self.event_names, &mut refs);
            if !refs.is_disjoint(&failed) {
                failed.insert(name);
                continue;
            }
            let path = join_path("events", &name);
            match self.resolve_value(raw, Some(short_name(&name)), &path) {
                Ok(resolved) => {
                    self.resolved_events.insert(name, resolved);
                }
                Err(error) => {
                    errors.push(error);
                    failed.insert(name);
                }
            }
        }
        if let Some(events) = cycle {
            errors.push(TemplateError::CyclicReference { events });
        }
    }

    /// Resolves a settings section; `{auto}` takes each top-level key's short name.
    ///
    /// A key that fails to resolve keeps its raw value and the failure is
    /// pushed to `errors`.
    pub fn resolve_settings(
        &self,
        settings: &Map<String, Value>,
        errors: &mut Vec<TemplateError>,
    ) -> Map<String, Value> {
        settings
            .iter()
            .map(|(key, value)| {
                let resolved = self
                    .resolve_value(value, Some(short_name(key)), &join_path("settings", key))
                    .unwrap_or_else(|error| {
                        errors.push(error);
                        value.clone()
                    });
                (key.clone(), resolved)
            })
            .collect()
    }

    /// Resolves an arbitrary tree. `auto` is the expansion of `{auto}`, if any.
    pub fn resolve_value(
        &self,
        value: &Value,
        auto: Option<&str>,
        path: &str,
    ) -> TemplateResult<Value> {
        match value {
            Value::String(text) => self.resolve_str(text, auto, path),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| self.resolve_value(item, auto, &join_path(path, &i.to_string())))
                .collect::<TemplateResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(key, item)| {
                    Ok((key.clone(), self.resolve_value(item, auto, &join_path(path, key))?))
                })
                .collect::<TemplateResult<Map<_, _>>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    fn resolve_str(&self, text: &str, auto: Option<&str>, path: &str) -> TemplateResult<Value> {
        let parts = segments(text);
        if let [Segment::Reference(expr)] = parts.as_slice() {
            return self.lookup(expr, auto, path);
        }

        let mut out = String::with_capacity(text.len());
        for part in parts {
            match part {
                Segment::Literal(literal) => out.push_str(literal),
                Segment::Reference(expr) => match self.lookup(expr, auto, path)? {
                    Value::String(s) => out.push_str(&s),
                    Value::Number(n) => out.push_str(&n.to_string()),
                    Value::Bool(b) => out.push_str(if b { "true" } else { "false" }),
                    Value::Null => out.push_str("null"),
                    Value::Array(_) | Value::Object(_) => {
                        return Err(TemplateError::NonScalar {
                            reference: expr.to_string(),
                            path: path.to_string(),
                        })
                    }
                },
            }
        }
        Ok(Value::String(out))
    }

    fn lookup(&self, expr: &str, auto: Option<&str>, path: &str) -> TemplateResult<Value> {
        let unresolved = || TemplateError::Unresolved {
            reference: expr.to_string(),
            path: path.to_string(),
        };

        if expr == AUTO {
            return auto.map(|name| Value::String(name.to_string())).ok_or_else(unresolved);
        }

        if let Some(key) = expr.strip_prefix(ENV_PREFIX) {
            return get_map_path(&self.context.env, key)
                .cloned()
                .ok_or_else(|| TemplateError::MissingEnvKey {
                    key: key.to_string(),
                    path: path.to_string(),
                });
        }

        if let Some(field) = expr.strip_prefix(APP_PREFIX) {
            return match field {
                "name" => Ok(Value::String(self.context.app_name.clone())),
                "version" => Ok(Value::String(self.context.app_version.clone())),
                "route_version" => Ok(Value::String(self.context.app_version.replace('.', "x"))),
                _ => Err(unresolved()),
            };
        }

        if let Some(reference) = expr.strip_prefix(EVENTS_PREFIX) {
            let (event, field) =
                split_event_reference(reference, &self.event_names).ok_or_else(unresolved)?;
            return self
                .resolved_events
                .get(event)
                .and_then(|resolved| get_path(resolved, field))
                .cloned()
                .ok_or_else(unresolved);
        }

        Err(unresolved())
    }
}

fn short_name(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(_, short)| short)
}

/// Splits `<event>.<field path>` using the longest declared event name.
fn split_event_reference<'r>(
    reference: &'r str,
    event_names: &BTreeSet<String>,
) -> Option<(&'r str, &'r str)> {
    event_names
        .iter()
        .filter_map(|name| {
            if reference == name.as_str() {
                Some((&reference[..name.len()], ""))
            } else {
                reference
                    .strip_prefix(name.as_str())
                    .and_then(|rest| rest.strip_prefix('.'))
                    .map(|field| (&reference[..name.len()], field))
            }
        })
        .max_by_key(|(event, _)| event.len())
}

fn collect_event_refs(value: &Value, event_names: &BTreeSet<String>, out: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => {
            for part in segments(text) {
                if let Segment::Reference(expr) = part {
                    if let Some((event, _)) = expr
                        .strip_prefix(EVENTS_PREFIX)
                        .and_then(|reference| split_event_reference(reference, event_names))
                    {
                        out.insert(event.to_string());
                    }
                }
            }
        }
        Value::Array(items) => items
            .iter()
            .for_each(|item| collect_event_refs(item, event_names, out)),
        Value::Object(map) => map
            .values()
            .for_each(|item| collect_event_refs(item, event_names, out)),
        _ => {}
    }
}

/// Result of ordering events by their references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOrder {
    /// Events that can be resolved, each after the events it references
    pub order: Vec<String>,
    /// A reference cycle among the remaining events, if any
    pub cycle: Option<Vec<String>>,
}

/// Orders events so every event comes after the events it references.
///
/// Ties are broken by name, so the order is deterministic. Events on a
/// cycle, or depending on one, are left out of the order.
pub fn event_order(raw_events: &Map<String, Value>, event_names: &BTreeSet<String>) -> EventOrder {
    let mut dependencies: BTreeMap<String, BTreeSet<String>> = raw_events
        .iter()
        .map(|(name, raw)| {
            let mut refs = BTreeSet::new();
            collect_event_refs(raw, event_names, &mut refs);
            refs.retain(|dep| raw_events.contains_key(dep));
            (name.clone(), refs)
        })
        .collect();

    let mut ready: BTreeSet<String> = dependencies
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(name, _)| name.clone())
        .collect();
    let mut order = Vec::with_capacity(dependencies.len());

    while let Some(name) = ready.pop_first() {
        dependencies.remove(&name);
        for (dependent, deps) in &mut dependencies {
            if deps.remove(&name) && deps.is_empty() {
                ready.insert(dependent.clone());
            }
        }
        order.push(name);
    }

    let cycle = (!dependencies.is_empty()).then(|| find_cycle(&dependencies));
    EventOrder { order, cycle }
}

/// Walks unresolved dependencies until a node repeats.
fn find_cycle(remaining: &BTreeMap<String, BTreeSet<String>>) -> Vec<String> {
    let Some(mut current) = remaining.keys().next().cloned() else {
        return Vec::new();
    };
    let mut walk: Vec<String> = Vec::new();
    loop {
        if let Some(start) = walk.iter().position(|name| *name == current) {
            let mut cycle = walk.split_off(start);
            cycle.push(current);
            return cycle;
        }
        walk.push(current.clone());
        match remaining.get(&current).and_then(|deps| deps.iter().next()) {
            Some(next) => current = next.clone(),
            None => return walk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn context() -> ResolutionContext {
        let env = json!({ "fs": { "data_path": "/tmp/data" }, "stream_len": 100 });
        let Value::Object(env) = env else { unreachable!() };
        ResolutionContext::new("simple-example", "0.1").with_env(env)
    }

    fn events(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn resolve(raw: &Map<String, Value>) -> TemplateResult<Map<String, Value>> {
        let ctx = context();
        let mut resolver = TemplateResolver::new(&ctx, raw.keys().cloned());
        let mut errors = Vec::new();
        resolver.resolve_events(raw, &mut errors);
        match errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(resolver.into_resolved_events()),
        }
    }

    #[test]
    fn auto_resolves_to_short_event_name() {
        let raw = events(json!({
            "streams.something_event": {
                "type": "POST",
                "write_stream": { "name": "{auto}" }
            }
        }));
        let resolved = resolve(&raw).unwrap();
        assert_eq!(
            resolved["streams.something_event"]["write_stream"]["name"],
            json!("something_event")
        );
    }

    #[test]
    fn event_reference_follows_dependency_order() {
        let raw = events(json!({
            "a_consumer": {
                "type": "STREAM",
                "read_stream": { "name": "{events.streams.something_event.write_stream.name}" }
            },
            "streams.something_event": {
                "type": "POST",
                "write_stream": { "name": "{auto}" }
            }
        }));
        let resolved = resolve(&raw).unwrap();
        assert_eq!(resolved["a_consumer"]["read_stream"]["name"], json!("something_event"));
    }

    #[test]
    fn longest_event_name_wins() {
        let names: BTreeSet<String> = ["a".to_string(), "a.b".to_string()].into();
        assert_eq!(
            split_event_reference("a.b.write_stream.name", &names),
            Some(("a.b", "write_stream.name"))
        );
        assert_eq!(split_event_reference("a.c", &names), Some(("a", "c")));
        assert_eq!(split_event_reference("x.y", &names), None);
    }

    #[test]
    fn cycle_is_rejected() {
        let raw = events(json!({
            "a": { "read_stream": { "name": "{events.b.write_stream.name}" } },
            "b": { "write_stream": { "name": "{events.a.read_stream.name}" } },
            "c": { "write_stream": { "name": "c" } }
        }));
        match resolve(&raw) {
            Err(TemplateError::CyclicReference { events }) => {
                assert_eq!(events, vec!["a".to_string(), "b".to_string(), "a".to_string()]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn every_failure_is_reported_and_independent_events_resolve() {
        let raw = events(json!({
            "a": { "route": "{env.nope}" },
            "b": { "route": "{events.a.route}" },
            "c": { "x": "{events.d.y}" },
            "d": { "y": "{events.c.x}" },
            "e": { "path": "{env.fs.data_path}" },
            "f": { "x": "{app.nope}" }
        }));
        let ctx = context();
        let mut resolver = TemplateResolver::new(&ctx, raw.keys().cloned());
        let mut errors = Vec::new();
        resolver.resolve_events(&raw, &mut errors);

        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(matches!(errors[0], TemplateError::MissingEnvKey { .. }));
        assert!(matches!(errors[1], TemplateError::Unresolved { .. }));
        assert!(matches!(errors[2], TemplateError::CyclicReference { .. }));
        let resolved = resolver.into_resolved_events();
        assert_eq!(resolved.keys().collect::<Vec<_>>(), vec!["e"]);
        assert_eq!(resolved["e"]["path"], json!("/tmp/data"));
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let raw = events(json!({
            "a": { "write_stream": { "name": "x" }, "route": "{events.a.write_stream.name}" }
        }));
        assert!(matches!(resolve(&raw), Err(TemplateError::CyclicReference { .. })));
    }

    #[test]
    fn env_reference_keeps_json_type() {
        let raw = events(json!({
            "a": { "write_stream": { "name": "a", "target_max_len": "{env.stream_len}" } }
        }));
        let resolved = resolve(&raw).unwrap();
        assert_eq!(resolved["a"]["write_stream"]["target_max_len"], json!(100));
    }

    #[test]
    fn env_reference_embedded_in_text() {
        let raw = events(json!({
            "a": { "path": "{env.fs.data_path}/{app.name}/{app.route_version}" }
        }));
        let resolved = resolve(&raw).unwrap();
        assert_eq!(resolved["a"]["path"], json!("/tmp/data/simple-example/0x1"));
    }

    #[test]
    fn missing_env_key_fails() {
        let raw = events(json!({ "a": { "path": "{env.fs.missing}" } }));
        assert_eq!(
            resolve(&raw),
            Err(TemplateError::MissingEnvKey {
                key: "fs.missing".to_string(),
                path: "events.a.path".to_string(),
            })
        );
    }

    #[test]
    fn route_parameters_are_left_alone() {
        let raw = events(json!({ "a": { "route": "items/{item_id}/detail" } }));
        let resolved = resolve(&raw).unwrap();
        assert_eq!(resolved["a"]["route"], json!("items/{item_id}/detail"));
    }

    #[test]
    fn unknown_event_reference_is_unresolved() {
        let raw = events(json!({ "a": { "x": "{events.nope.write_stream.name}" } }));
        assert!(matches!(resolve(&raw), Err(TemplateError::Unresolved { .. })));
    }

    #[test]
    fn os_env_substitution_uppercases_names() {
        let os_env: BTreeMap<String, String> =
            [("REDIS_HOST".to_string(), "redis".to_string())].into();
        let mut value = json!({ "url": "redis://${redis_host}:6379" });
        let mut errors = Vec::new();
        substitute_os_env(&mut value, &os_env, "", &mut errors);
        assert!(errors.is_empty());
        assert_eq!(value["url"], json!("redis://redis:6379"));
    }

    #[test]
    fn missing_os_vars_are_all_reported() {
        let os_env: BTreeMap<String, String> = [("HOST".to_string(), "db".to_string())].into();
        let mut value = json!({ "url": "${NOT_SET}://${HOST}", "other": ["${ALSO_NOT_SET}"] });
        let mut errors = Vec::new();
        substitute_os_env(&mut value, &os_env, "env", &mut errors);
        assert_eq!(
            errors,
            vec![
                TemplateError::MissingOsVar {
                    var: "ALSO_NOT_SET".to_string(),
                    path: "env.other.0".to_string(),
                },
                TemplateError::MissingOsVar {
                    var: "NOT_SET".to_string(),
                    path: "env.url".to_string(),
                },
            ]
        );
        assert_eq!(value["url"], json!("${NOT_SET}://db"));
    }

    #[test]
    fn settings_auto_uses_key_short_name() {
        let ctx = context();
        let resolver = TemplateResolver::new(&ctx, Vec::<String>::new());
        let settings = events(json!({ "streams.something_event": { "tag": "{auto}" } }));
        let mut errors = Vec::new();
        let resolved = resolver.resolve_settings(&settings, &mut errors);
        assert!(errors.is_empty());
        assert_eq!(resolved["streams.something_event"]["tag"], json!("something_event"));
    }

    #[test]
    fn non_scalar_cannot_be_embedded() {
        let raw = events(json!({ "a": { "x": "prefix-{env.fs}" } }));
        assert!(matches!(resolve(&raw), Err(TemplateError::NonScalar { .. })));
    }

    proptest! {
        #[test]
        fn resolution_is_deterministic(len in 1usize..8, suffix in "[a-z]{1,8}") {
            let mut raw = Map::new();
            raw.insert(
                "e0".to_string(),
                json!({ "write_stream": { "name": format!("{{auto}}-{suffix}") } }),
            );
            for i in 1..len {
                raw.insert(
                    format!("e{i}"),
                    json!({
                        "read_stream": {
                            "name": format!("{{events.e{}.write_stream.name}}", i - 1)
                        },
                        "write_stream": {
                            "name": format!("{{auto}}-{{app.name}}-{{env.stream_len}}")
                        }
                    }),
                );
            }
            let first = resolve(&raw).unwrap();
            let second = resolve(&raw).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.len(), len);
        }
    }
}
