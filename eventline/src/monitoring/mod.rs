//! Observability: structured event logs and read-loop statistics.

pub mod logging;
pub mod stats;

pub use logging::{init_tracing, EventLog, LogEntry, LogLevel, StructuredLogger};
pub use stats::{StatsSnapshot, StreamStats};
