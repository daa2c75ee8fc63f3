//! Configuration scenarios: resolution determinism, cycles, plugin merge
//! order and the `{auto}` placeholder, loaded the way a process loads them.

#![allow(clippy::unwrap_used)]

use eventline::config::{AppConfig, ConfigLoader, ConfigMerger, EventType, ServerConfig};
use eventline::errors::{ConfigError, ConfigIssue, TemplateError};
use eventline::types::QueueName;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

fn app_config(value: Value) -> AppConfig {
    serde_json::from_value(value).unwrap()
}

fn server() -> ServerConfig {
    serde_json::from_value(json!({ "streams": { "delay_auto_start_seconds": 0 } })).unwrap()
}

fn plugin(name: &str, event: &str) -> AppConfig {
    app_config(json!({
        "app": { "name": name, "version": "1.0" },
        "settings": { event: { "owner": name } },
        "events": {
            event: {
                "type": "STREAM",
                "read_stream": { "name": "audit", "queues": ["AUTO"] },
                "write_stream": { "name": format!("{name}-out") }
            }
        }
    }))
}

#[test]
fn auto_resolves_to_event_short_name() {
    let app = app_config(json!({
        "app": { "name": "simple-example", "version": "0.1" },
        "events": {
            "streams.something_event": {
                "type": "POST",
                "write_stream": { "name": "{auto}", "queues": ["high-prio", "AUTO"] }
            },
            "streams.process_events": {
                "type": "STREAM",
                "read_stream": {
                    "name": "{events.streams.something_event.write_stream.name}",
                    "consumer_group": "g1",
                    "queues": ["high-prio", "AUTO"]
                }
            }
        }
    }));

    let resolved = ConfigMerger::new().merge(&server(), &[], &app).unwrap();
    let producer = resolved.event("streams.something_event").unwrap();
    let binding = producer.write_stream.as_ref().unwrap();
    assert_eq!(binding.name.to_string(), "something_event");
    assert_eq!(
        binding.queues,
        vec![QueueName::try_new("high-prio").unwrap(), QueueName::auto()]
    );
    assert_eq!(producer.route.as_deref(), Some("simple-example/0x1/streams/something_event"));

    let consumer = resolved.event("streams.process_events").unwrap();
    assert_eq!(consumer.event_type, EventType::Stream);
    let read = consumer.read_stream.as_ref().unwrap();
    assert_eq!(read.name.to_string(), "something_event");
    assert_eq!(read.consumer_group.to_string(), "g1");
}

#[test]
fn reference_cycle_fails_without_partial_config() {
    let app = app_config(json!({
        "app": { "name": "loop", "version": "1.0" },
        "events": {
            "a": {
                "type": "STREAM",
                "read_stream": { "name": "{events.b.write_stream.name}" },
                "write_stream": { "name": "a-out" }
            },
            "b": {
                "type": "STREAM",
                "read_stream": { "name": "{events.a.write_stream.name}" },
                "write_stream": { "name": "{events.a.read_stream.name}" }
            }
        }
    }));

    let err = ConfigMerger::new().merge(&server(), &[], &app).unwrap_err();
    match err.issues() {
        [ConfigIssue::Template(TemplateError::CyclicReference { events })] => {
            assert!(events.contains(&"a".to_string()));
            assert!(events.contains(&"b".to_string()));
            assert_eq!(events.first(), events.last());
        }
        other => panic!("expected cyclic reference, got {other:?}"),
    }
}

#[test]
fn plugin_order_does_not_change_the_result() {
    let app = app_config(json!({
        "app": { "name": "host", "version": "2.0" },
        "plugins": [
            { "name": "audit-a", "version": "1.0" },
            { "name": "audit-b", "version": "1.0" }
        ],
        "events": {
            "report": { "type": "GET" }
        }
    }));
    let a = plugin("audit-a", "collect_a");
    let b = plugin("audit-b", "collect_b");

    let merger = ConfigMerger::new();
    let forward = merger.merge(&server(), &[a.clone(), b.clone()], &app).unwrap();
    let backward = merger.merge(&server(), &[b, a], &app).unwrap();
    assert_eq!(forward, backward);
    assert_eq!(forward.events.len(), 3);
    assert_eq!(
        forward
            .event("collect_a")
            .unwrap()
            .read_stream
            .as_ref()
            .unwrap()
            .consumer_group
            .to_string(),
        "host.2x0.collect_a"
    );
}

#[test]
fn conflicting_plugins_are_all_reported() {
    let app = app_config(json!({
        "app": { "name": "host", "version": "2.0" },
        "plugins": [ { "name": "p1", "version": "1.0" }, { "name": "p2", "version": "1.0" } ],
        "settings": { "shared": { "limit": 3 } }
    }));
    let mut p1 = AppConfig::new("p1", "1.0");
    p1.settings = json!({ "shared": { "limit": 1 } }).as_object().unwrap().clone();
    let mut p2 = AppConfig::new("p2", "1.0");
    p2.settings = json!({ "shared": { "limit": 2 } }).as_object().unwrap().clone();

    let err = ConfigMerger::new().merge(&server(), &[p1, p2], &app).unwrap_err();
    let ConfigError::Invalid { issues } = err else {
        panic!("expected aggregated issues");
    };
    assert_eq!(issues.len(), 2);
}

fn chain_config(length: usize, with_env: bool) -> AppConfig {
    let mut events = serde_json::Map::new();
    events.insert(
        "e0".to_string(),
        json!({
            "type": "POST",
            "write_stream": { "name": if with_env { "{env.prefix}-root" } else { "root" } }
        }),
    );
    for i in 1..length {
        events.insert(
            format!("e{i}"),
            json!({
                "type": "STREAM",
                "read_stream": { "name": format!("{{events.e{}.write_stream.name}}", i - 1) },
                "write_stream": { "name": format!("{{events.e{}.write_stream.name}}-{i}", i - 1) }
            }),
        );
    }
    let mut app = AppConfig::new("chain", "1.0");
    app.env = json!({ "prefix": "env" }).as_object().unwrap().clone();
    app.events = events;
    app
}

proptest! {
    #[test]
    fn resolving_twice_is_identical(length in 1usize..12, with_env in any::<bool>()) {
        let app = chain_config(length, with_env);
        let merger = ConfigMerger::new();
        let first = merger.merge(&server(), &[], &app).unwrap();
        let second = merger.merge(&server(), &[], &app).unwrap();
        prop_assert_eq!(&first, &second);

        let last = first.event(&format!("e{}", length - 1)).unwrap();
        let expected_suffix: String = (1..length).map(|i| format!("-{i}")).collect();
        let root = if with_env { "env-root" } else { "root" };
        prop_assert_eq!(
            last.write_stream.as_ref().unwrap().name.to_string(),
            format!("{root}{expected_suffix}")
        );
    }
}

struct TempDir(PathBuf);

impl TempDir {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("eventline-it-{}", uuid_like()));
        std::fs::create_dir_all(&dir).unwrap();
        Self(dir)
    }

    fn write(&self, name: &str, value: &Value) -> PathBuf {
        let path = self.0.join(name);
        std::fs::write(&path, serde_json::to_vec_pretty(value).unwrap()).unwrap();
        path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn uuid_like() -> String {
    format!(
        "{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    )
}

#[test]
fn files_are_merged_in_order_and_os_env_substituted() {
    let dir = TempDir::new();
    let server_file = dir.write("server.json", &json!({ "logging": { "log_level": "debug" } }));
    let base = dir.write(
        "app.json",
        &json!({
            "app": { "name": "files", "version": "1.0" },
            "env": { "db": { "url": "${DB_URL}" } },
            "events": { "query": { "type": "GET", "setting_keys": ["db"] } },
            "settings": { "db": { "url": "{env.db.url}", "pool": 2 } }
        }),
    );
    let overlay = dir.write("app-local.json", &json!({ "settings": { "db": { "pool": 8 } } }));

    let os_env: BTreeMap<String, String> =
        [("DB_URL".to_string(), "mem://test".to_string())].into();
    let loader = ConfigLoader::with_merger(ConfigMerger::with_os_env(os_env));
    let resolved = loader
        .load(&[server_file], &Vec::<Vec<PathBuf>>::new(), &[base, overlay])
        .unwrap();

    assert_eq!(resolved.setting("db"), Some(&json!({ "url": "mem://test", "pool": 8 })));
}

#[test]
fn missing_os_variable_is_fatal() {
    let mut app = AppConfig::new("files", "1.0");
    app.settings = json!({ "db": { "url": "${DB_URL}" } }).as_object().unwrap().clone();
    let err = ConfigMerger::new().merge(&server(), &[], &app).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { .. }));
    assert!(matches!(
        err.issues(),
        [ConfigIssue::Template(TemplateError::MissingOsVar { var, .. })] if var == "DB_URL"
    ));
}
