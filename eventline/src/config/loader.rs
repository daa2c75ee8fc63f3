//! Reading configuration files from disk.
//!
//! Each role (server, plugin, app) may be split across several JSON files;
//! they are deep-merged in the order given, later files winning, before
//! being parsed into their raw layer type.

use super::merge::ConfigMerger;
use super::{AppConfig, ResolvedAppConfig, ServerConfig};
use crate::errors::{ConfigError, ConfigResult};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Deep-merges `overlay` into `base`; objects merge key by key, anything
/// else is replaced.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Loads configuration layers and resolves them.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    merger: ConfigMerger,
}

impl ConfigLoader {
    /// A loader that captures the current process environment for `${VAR}`.
    pub fn new() -> Self {
        Self {
            merger: ConfigMerger::from_process_env(),
        }
    }

    /// A loader using the given merger.
    pub const fn with_merger(merger: ConfigMerger) -> Self {
        Self { merger }
    }

    /// Reads one JSON file.
    pub fn read_json(path: &Path) -> ConfigResult<Value> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads and deep-merges files in order.
    pub fn load_fragment<P: AsRef<Path>>(paths: &[P]) -> ConfigResult<Value> {
        let mut merged = Value::Object(Map::new());
        for path in paths {
            debug!(path = %path.as_ref().display(), "reading config file");
            deep_merge(&mut merged, Self::read_json(path.as_ref())?);
        }
        Ok(merged)
    }

    fn load_typed<T: DeserializeOwned, P: AsRef<Path>>(paths: &[P]) -> ConfigResult<T> {
        let merged = Self::load_fragment(paths)?;
        serde_json::from_value(merged).map_err(|source| ConfigError::Parse {
            path: paths
                .first()
                .map_or_else(PathBuf::new, |p| p.as_ref().to_path_buf()),
            source,
        })
    }

    /// Loads the server configuration; no files yields the defaults.
    pub fn load_server<P: AsRef<Path>>(paths: &[P]) -> ConfigResult<ServerConfig> {
        Self::load_typed(paths)
    }

    /// Loads one app or plugin layer.
    pub fn load_app<P: AsRef<Path>>(paths: &[P]) -> ConfigResult<AppConfig> {
        Self::load_typed(paths)
    }

    /// Merges, resolves and validates already loaded layers.
    pub fn resolve(
        &self,
        server: &ServerConfig,
        plugins: &[AppConfig],
        app: &AppConfig,
    ) -> ConfigResult<ResolvedAppConfig> {
        let resolved = self.merger.merge(server, plugins, app)?;
        info!(
            app_key = %resolved.app.app_key(),
            events = resolved.events.len(),
            plugins = resolved.plugins.len(),
            "app configuration resolved"
        );
        Ok(resolved)
    }

    /// Loads every layer from disk and resolves the app.
    pub fn load<S, P, A>(
        &self,
        server: &[S],
        plugins: &[Vec<P>],
        app: &[A],
    ) -> ConfigResult<ResolvedAppConfig>
    where
        S: AsRef<Path>,
        P: AsRef<Path>,
        A: AsRef<Path>,
    {
        let server = Self::load_server(server)?;
        let plugins = plugins
            .iter()
            .map(|files| Self::load_app(files))
            .collect::<ConfigResult<Vec<_>>>()?;
        let app = Self::load_app(app)?;
        self.resolve(&server, &plugins, &app)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct TempFile(PathBuf);

    impl TempFile {
        fn new(contents: &str) -> Self {
            let path =
                std::env::temp_dir().join(format!("eventline-{}.json", uuid::Uuid::new_v4()));
            std::fs::write(&path, contents).unwrap();
            Self(path)
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn deep_merge_overlays_nested_objects() {
        let mut base = json!({ "a": { "b": 1, "c": 2 }, "list": [1, 2] });
        deep_merge(&mut base, json!({ "a": { "c": 3 }, "list": [3] }));
        assert_eq!(base, json!({ "a": { "b": 1, "c": 3 }, "list": [3] }));
    }

    #[test]
    fn later_files_win() {
        let first = TempFile::new(
            r#"{ "app": { "name": "demo", "version": "1.0" }, "env": { "x": 1, "y": 1 } }"#,
        );
        let second = TempFile::new(r#"{ "env": { "y": 2 } }"#);

        let app = ConfigLoader::load_app(&[&first.0, &second.0]).unwrap();
        assert_eq!(app.app.name, "demo");
        assert_eq!(Value::Object(app.env), json!({ "x": 1, "y": 2 }));
    }

    #[test]
    fn empty_server_list_gives_defaults() {
        let server = ConfigLoader::load_server::<PathBuf>(&[]).unwrap();
        assert_eq!(server, ServerConfig::default());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = ConfigLoader::read_json(Path::new("/definitely/not/here.json"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let file = TempFile::new("{ not json");
        let result = ConfigLoader::read_json(&file.0);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn load_resolves_every_layer() {
        let server = TempFile::new(r#"{ "streams": { "flush_interval_ms": 50 } }"#);
        let app = TempFile::new(
            r#"{
                "app": { "name": "demo", "version": "1.0" },
                "events": { "hello": { "type": "GET" } }
            }"#,
        );
        let loader = ConfigLoader::with_merger(ConfigMerger::new());
        let resolved = loader
            .load(&[&server.0], &Vec::<Vec<PathBuf>>::new(), &[&app.0])
            .unwrap();
        assert_eq!(resolved.streams.flush_interval_ms, 50);
        assert_eq!(resolved.event("hello").unwrap().route.as_deref(), Some("demo/1x0/hello"));
    }
}
