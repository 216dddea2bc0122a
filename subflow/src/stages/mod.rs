//! Stage trait and implementations.
//!
//! Stages are the fundamental units of work in a pipeline. A stage checks its
//! preconditions, produces a new context, checks its postconditions, and
//! releases whatever it acquired.

use crate::context::PipelineContext;
use crate::errors::StageError;
use async_trait::async_trait;
use std::fmt::Debug;

/// Trait for pipeline stages.
///
/// `execute` may run more than once for the same group (retries, or a new
/// worker reclaiming a stale lease), so implementations must overwrite their
/// outputs rather than append to them.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Checks preconditions. An `Err` is a validation failure and is never retried.
    fn validate(&self, _ctx: &PipelineContext) -> Result<(), String> {
        Ok(())
    }

    /// Executes the stage and returns the updated context.
    ///
    /// Long-running work should watch `ctx.cancellation()`.
    async fn execute(&self, ctx: &PipelineContext) -> Result<PipelineContext, StageError>;

    /// Checks postconditions on the context returned by `execute`.
    fn validate_outputs(&self, _ctx: &PipelineContext) -> Result<(), String> {
        Ok(())
    }

    /// Releases resources acquired by `execute`. Must not fail.
    async fn cleanup(&self, _ctx: &PipelineContext) {}
}

/// A simple function-based stage.
pub struct FnStage<F>
where
    F: Fn(&PipelineContext) -> Result<PipelineContext, StageError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&PipelineContext) -> Result<PipelineContext, StageError> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&PipelineContext) -> Result<PipelineContext, StageError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&PipelineContext) -> Result<PipelineContext, StageError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &PipelineContext) -> Result<PipelineContext, StageError> {
        (self.func)(ctx)
    }
}

/// A stage that passes the context through unchanged.
#[derive(Debug, Clone)]
pub struct NoOpStage {
    name: String,
}

impl NoOpStage {
    /// Creates a new no-op stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Stage for NoOpStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &PipelineContext) -> Result<PipelineContext, StageError> {
        Ok(ctx.clone())
    }
}
