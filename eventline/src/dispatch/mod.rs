//! Event execution.
//!
//! A [`Dispatcher`] is built once at startup from the resolved configuration
//! and the registered [`EventHandler`]s. It resolves a [`Trigger`] to its
//! event, assembles an [`EventContext`], runs the event's steps and publishes
//! the final payloads to the event's write stream.

pub mod context;
pub mod dispatcher;
pub mod steps;

pub use context::{
    EventContext, TRACK_OPERATION_ID, TRACK_PREFIX, TRACK_REQUEST_ID, TRACK_REQUEST_TS,
};
pub use dispatcher::{Dispatcher, DispatcherBuilder, EventOutcome, HttpRequest, Trigger};
pub use steps::{EventHandler, FnStep, PipelineError, ServiceSource, Step, StepError, StepOutput};
