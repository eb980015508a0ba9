//! Step handlers: the units of work leaf nodes run.
//!
//! Handlers use native async fn in traits. `BoxStepHandler` provides the
//! object-safe wrapper the registry stores, following the same blanket-impl
//! pattern as the other boxed ports:
//! 1. Define an object-safe `StepHandlerDyn` trait with boxed futures
//! 2. Blanket-impl `StepHandlerDyn` for all `T: StepHandler`
//! 3. `BoxStepHandler` wraps `Box<dyn StepHandlerDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cairn_types::ambiance::Ambiance;
use cairn_types::graph::PlanNode;
use cairn_types::node::StepResponse;
use cairn_types::status::Status;

/// Input handed to a step handler.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub ambiance: Ambiance,
    pub node_execution_id: Uuid,
    pub node: PlanNode,
    /// Correlation id an external executor delivers the result to when the
    /// handler returns [`StepOutcome::Waiting`].
    pub callback_id: String,
    /// Cancelled when the plan is aborted.
    pub cancel: CancellationToken,
    pub attempt: u32,
}

impl StepContext {
    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.node.parameters.get(key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step finished inline. A non-final status parks the node in it.
    Completed(StepResponse),
    /// The result arrives later on `callback_id`. The node waits in `status`.
    Waiting { status: Status },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("step failed: {0}")]
    Failed(String),

    #[error("no handler registered for step type '{0}'")]
    UnknownStepType(String),
}

pub trait StepHandler: Send + Sync {
    fn step_type(&self) -> &str;

    fn start(
        &self,
        ctx: &StepContext,
    ) -> impl Future<Output = Result<StepOutcome, StepError>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn step_type(&self) -> &str;

    fn start_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome, StepError>> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn step_type(&self) -> &str {
        StepHandler::step_type(self)
    }

    fn start_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome, StepError>> + Send + 'a>> {
        Box::pin(self.start(ctx))
    }
}

/// Type-erased step handler.
pub struct BoxStepHandler {
    inner: Box<dyn StepHandlerDyn>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub fn step_type(&self) -> &str {
        self.inner.step_type()
    }

    pub async fn start(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        self.inner.start_boxed(ctx).await
    }
}

impl std::fmt::Debug for BoxStepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepHandler")
            .field("step_type", &self.step_type())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Step handlers keyed by step type.
#[derive(Debug, Default, Clone)]
pub struct StepRegistry {
    handlers: HashMap<String, Arc<BoxStepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `noop`, `fail` and `wait`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(NoopStep);
        registry.register(FailStep);
        registry.register(ExternalStep);
        registry
    }

    /// Register `handler`, replacing any handler of the same step type.
    pub fn register<T: StepHandler + 'static>(&mut self, handler: T) {
        let handler = BoxStepHandler::new(handler);
        self.handlers
            .insert(handler.step_type().to_string(), Arc::new(handler));
    }

    pub fn get(&self, step_type: &str) -> Result<Arc<BoxStepHandler>, StepError> {
        self.handlers
            .get(step_type)
            .cloned()
            .ok_or_else(|| StepError::UnknownStepType(step_type.to_string()))
    }

    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

// ---------------------------------------------------------------------------
// Built-in steps
// ---------------------------------------------------------------------------

/// Succeeds immediately with `parameters.outputs`.
#[derive(Debug, Clone, Copy)]
pub struct NoopStep;

impl StepHandler for NoopStep {
    fn step_type(&self) -> &str {
        "noop"
    }

    async fn start(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let outputs = ctx.parameter("outputs").cloned().unwrap_or(Value::Null);
        Ok(StepOutcome::Completed(StepResponse::succeeded(outputs)))
    }
}

/// Fails with `parameters.message`.
#[derive(Debug, Clone, Copy)]
pub struct FailStep;

impl StepHandler for FailStep {
    fn step_type(&self) -> &str {
        "fail"
    }

    async fn start(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let message = ctx
            .parameter("message")
            .and_then(Value::as_str)
            .unwrap_or("step failed");
        Ok(StepOutcome::Completed(StepResponse::failed(message)))
    }
}

/// Parks the node until an external executor delivers the result.
///
/// `parameters.status` selects the waiting status (default `async_waiting`),
/// e.g. `approval_waiting` for a manual approval gate.
#[derive(Debug, Clone, Copy)]
pub struct ExternalStep;

impl StepHandler for ExternalStep {
    fn step_type(&self) -> &str {
        "wait"
    }

    async fn start(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let status = match ctx.parameter("status").and_then(Value::as_str) {
            Some(raw) => raw
                .parse::<Status>()
                .map_err(|e| StepError::Failed(e.to_string()))?,
            None => Status::AsyncWaiting,
        };
        if status.is_final() {
            return Err(StepError::Failed(format!(
                "cannot wait in final status '{status}'"
            )));
        }
        Ok(StepOutcome::Waiting { status })
    }
}
