//! Step pipelines executed by events.

use super::context::EventContext;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// What a step produced from one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutput {
    /// A single payload for the next step.
    One(Value),
    /// Several payloads, each continuing through the remaining steps.
    Many(Vec<Value>),
    /// Nothing; this branch of the pipeline ends here.
    Empty,
}

/// A step failure; aborts the whole chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    /// Failure description
    pub message: String,
}

impl StepError {
    /// Creates a step error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StepError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(error.to_string())
    }
}

/// One stage of an event's pipeline.
#[async_trait]
pub trait Step: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Processes one payload.
    async fn run(&self, payload: Value, context: &EventContext) -> Result<StepOutput, StepError>;
}

/// Adapts a synchronous function into a [`Step`].
pub struct FnStep<F> {
    name: String,
    func: F,
}

impl<F> FnStep<F>
where
    F: Fn(Value, &EventContext) -> Result<StepOutput, StepError> + Send + Sync,
{
    /// Wraps `func` as a step called `name`.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> fmt::Debug for FnStep<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep").field("name", &self.name).finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: Fn(Value, &EventContext) -> Result<StepOutput, StepError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, payload: Value, context: &EventContext) -> Result<StepOutput, StepError> {
        (self.func)(payload, context)
    }
}

/// A pipeline failure, naming the failing step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineError {
    /// Step that failed
    pub step: String,
    /// The failure
    pub error: StepError,
}

/// The ordered steps of one event.
#[derive(Clone, Default)]
pub struct EventHandler {
    steps: Vec<Arc<dyn Step>>,
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|step| step.name().to_string()))
            .finish()
    }
}

impl EventHandler {
    /// An empty pipeline; payloads pass through unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Appends a synchronous function as a step.
    #[must_use]
    pub fn then<F>(self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value, &EventContext) -> Result<StepOutput, StepError> + Send + Sync + 'static,
    {
        self.step(FnStep::new(name, func))
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the pipeline has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs `payload` through every step, fanning out on [`StepOutput::Many`].
    ///
    /// Returns the final payloads in production order. The first failing
    /// step aborts the chain.
    pub async fn run(
        &self,
        payload: Value,
        context: &EventContext,
    ) -> Result<Vec<Value>, PipelineError> {
        let mut current = vec![payload];
        for step in &self.steps {
            let mut next = Vec::with_capacity(current.len());
            for item in current {
                match step.run(item, context).await {
                    Ok(StepOutput::One(value)) => next.push(value),
                    Ok(StepOutput::Many(values)) => next.extend(values),
                    Ok(StepOutput::Empty) => {}
                    Err(error) => {
                        return Err(PipelineError {
                            step: step.name().to_string(),
                            error,
                        })
                    }
                }
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }
        Ok(current)
    }
}

/// Payload producer driving a SERVICE event.
///
/// The runtime calls `next` in a loop until it returns `None` or the
/// runtime stops; each payload then runs through the event's steps.
#[async_trait]
pub trait ServiceSource: Send + Sync {
    /// The next payloads to process, or `None` when the service is done.
    async fn next(&self, context: &EventContext) -> Result<Option<Vec<Value>>, StepError>;
}
