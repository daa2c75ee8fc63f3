//! Startup-built index of every declared event.
//!
//! The registry is built once from a [`ResolvedAppConfig`] and never
//! mutated; a reload builds a new registry and swaps it in whole.

use crate::config::{EventDescriptor, EventType, ResolvedAppConfig, DEFAULT_GROUP};
use crate::errors::{RegistryError, RegistryResult};
use crate::types::{EventName, StreamName};
use std::collections::{BTreeMap, BTreeSet, HashMap};

fn normalize_route(route: &str) -> &str {
    route.trim_matches('/')
}

fn is_param(segment: &str) -> bool {
    segment.len() > 2 && segment.starts_with('{') && segment.ends_with('}')
}

/// Index of events by name and by HTTP method and route.
#[derive(Debug, Clone, Default)]
pub struct EventRegistry {
    events: BTreeMap<EventName, EventDescriptor>,
    routes: HashMap<(&'static str, String), EventName>,
}

impl EventRegistry {
    /// Every duplicate event name and duplicate (method, route) pair.
    pub fn conflicts<'d, I>(descriptors: I) -> Vec<RegistryError>
    where
        I: IntoIterator<Item = &'d EventDescriptor>,
    {
        let mut names: BTreeSet<&EventName> = BTreeSet::new();
        let mut routes: HashMap<(&'static str, &str), &EventName> = HashMap::new();
        let mut errors = Vec::new();

        for descriptor in descriptors {
            if !names.insert(&descriptor.name) {
                errors.push(RegistryError::DuplicateEvent(descriptor.name.clone()));
            }
            if let Some((method, route)) = descriptor.http_binding() {
                let key = (method, normalize_route(route));
                if let Some(first) = routes.get(&key) {
                    errors.push(RegistryError::DuplicateRoute {
                        method: method.to_string(),
                        route: key.1.to_string(),
                        first: (*first).clone(),
                        second: descriptor.name.clone(),
                    });
                } else {
                    routes.insert(key, &descriptor.name);
                }
            }
        }
        errors
    }

    /// Builds a registry, failing on the first duplicate.
    pub fn build<I>(descriptors: I) -> RegistryResult<Self>
    where
        I: IntoIterator<Item = EventDescriptor>,
    {
        let descriptors: Vec<EventDescriptor> = descriptors.into_iter().collect();
        if let Some(error) = Self::conflicts(&descriptors).into_iter().next() {
            return Err(error);
        }

        let mut registry = Self::default();
        for descriptor in descriptors {
            if let Some((method, route)) = descriptor.http_binding() {
                registry
                    .routes
                    .insert((method, normalize_route(route).to_string()), descriptor.name.clone());
            }
            registry.events.insert(descriptor.name.clone(), descriptor);
        }
        Ok(registry)
    }

    /// Builds the registry of an application.
    pub fn from_config(config: &ResolvedAppConfig) -> RegistryResult<Self> {
        Self::build(config.events.values().cloned())
    }

    /// Looks up an event by name.
    pub fn get(&self, name: &str) -> Option<&EventDescriptor> {
        EventName::try_new(name)
            .ok()
            .and_then(|name| self.events.get(&name))
    }

    /// Looks up the event serving `method` on `route`.
    ///
    /// An exact match on the declared route template wins; otherwise
    /// `{param}` segments of declared routes match any single path segment.
    pub fn by_route(&self, method: &str, route: &str) -> Option<&EventDescriptor> {
        let method = match method.to_ascii_uppercase().as_str() {
            "GET" => "GET",
            "POST" => "POST",
            _ => return None,
        };
        let route = normalize_route(route);

        if let Some(name) = self.routes.get(&(method, route.to_string())) {
            return self.events.get(name);
        }

        let wanted: Vec<&str> = route.split('/').collect();
        self.routes
            .iter()
            .filter(|((m, _), _)| *m == method)
            .filter(|((_, template), _)| {
                let declared: Vec<&str> = template.split('/').collect();
                declared.len() == wanted.len()
                    && declared
                        .iter()
                        .zip(&wanted)
                        .all(|(d, w)| is_param(d) || d == w)
            })
            .map(|(_, name)| name)
            .min()
            .and_then(|name| self.events.get(name))
    }

    /// Every event, ordered by name.
    pub fn events(&self) -> impl Iterator<Item = &EventDescriptor> {
        self.events.values()
    }

    /// Events of one type, ordered by name.
    pub fn of_type(&self, event_type: EventType) -> impl Iterator<Item = &EventDescriptor> {
        self.events
            .values()
            .filter(move |descriptor| descriptor.event_type == event_type)
    }

    /// Events this process runs given its enabled groups.
    ///
    /// An empty list enables every group; `DEFAULT` is always enabled.
    pub fn effective_events<'r>(
        &'r self,
        enabled_groups: &'r [String],
    ) -> impl Iterator<Item = &'r EventDescriptor> {
        self.events.values().filter(move |descriptor| {
            enabled_groups.is_empty()
                || descriptor.group == DEFAULT_GROUP
                || enabled_groups.iter().any(|group| *group == descriptor.group)
        })
    }

    /// STREAM events reading from `stream`.
    pub fn consumers_of<'r>(
        &'r self,
        stream: &'r StreamName,
    ) -> impl Iterator<Item = &'r EventDescriptor> {
        self.events.values().filter(move |descriptor| {
            descriptor
                .read_stream
                .as_ref()
                .is_some_and(|binding| binding.name == *stream)
        })
    }

    /// Number of registered events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no events are registered.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
