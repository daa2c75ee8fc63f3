//! `Eventline` - layered configuration and stream events for microservices
//!
//! An application declares its events in JSON configuration: HTTP endpoints,
//! consumers of durable streams, periodic services and setup hooks. This
//! library merges server, plugin and app configuration into one immutable,
//! placeholder-free [`config::ResolvedAppConfig`], builds the event table,
//! and runs events against partitioned streams with consumer groups:
//!
//! - [`config`] resolves `{env.*}`, `{events.*}`, `{app.*}`, `{auto}` and
//!   `${OS_VAR}` references and merges layers with conflict detection
//! - [`registry`] indexes events by name, route and type
//! - [`stream`] publishes and reads through a pluggable [`stream::StreamLog`]
//!   with batching, throttling, trimming and publish retries
//! - [`dispatch`] runs step pipelines for HTTP and stream triggers and
//!   chains events through their write streams
//! - [`runtime`] drives SETUP events, read loops and service loops

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod collaborators;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod monitoring;
pub mod registry;
pub mod runtime;
pub mod stream;
pub mod types;

pub use config::{ConfigLoader, ConfigMerger, ResolvedAppConfig};
pub use dispatch::{Dispatcher, EventContext, EventHandler, HttpRequest, StepOutput, Trigger};
pub use errors::{ConfigError, DispatchError, RuntimeError, StreamError, TemplateError};
pub use registry::EventRegistry;
pub use runtime::AppRuntime;
pub use stream::{StreamLog, StreamManager, StreamMessage};
