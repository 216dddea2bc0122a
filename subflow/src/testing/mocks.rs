//! Mock stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::context::PipelineContext;
use crate::errors::StageError;
use crate::stages::Stage;

/// A stage that plays back a script of failures before succeeding.
///
/// Each `execute` call pops the next scripted result; once the script is
/// empty every call succeeds. Success writes `<name>` = call number to outputs.
#[derive(Debug)]
pub struct ScriptedStage {
    name: String,
    script: Mutex<VecDeque<StageError>>,
    calls: AtomicUsize,
    cleanups: AtomicUsize,
}

impl ScriptedStage {
    /// Creates a stage that always succeeds.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::failing_with(name, Vec::new())
    }

    /// Creates a stage that returns `errors` in order, then succeeds.
    #[must_use]
    pub fn failing_with(name: impl Into<String>, errors: impl IntoIterator<Item = StageError>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(errors.into_iter().collect()),
            calls: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        }
    }

    /// Returns the number of times `execute` ran.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns the number of times `cleanup` ran.
    #[must_use]
    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &PipelineContext) -> Result<PipelineContext, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.script.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(ctx.with_output(&self.name, json!(call))),
        }
    }

    async fn cleanup(&self, _ctx: &PipelineContext) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// A stage that always fails with the same error.
#[derive(Debug)]
pub struct FailingStage {
    name: String,
    error: StageError,
    calls: AtomicUsize,
}

impl FailingStage {
    /// Creates a new failing stage.
    #[must_use]
    pub fn new(name: impl Into<String>, error: StageError) -> Self {
        Self {
            name: name.into(),
            error,
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of times `execute` ran.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &PipelineContext) -> Result<PipelineContext, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// A stage that sleeps before succeeding and ignores cancellation.
#[derive(Debug)]
pub struct SlowStage {
    name: String,
    delay: Duration,
    cleanups: AtomicUsize,
}

impl SlowStage {
    /// Creates a new slow stage.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            cleanups: AtomicUsize::new(0),
        }
    }

    /// Returns the number of times `cleanup` ran.
    #[must_use]
    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for SlowStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &PipelineContext) -> Result<PipelineContext, StageError> {
        tokio::time::sleep(self.delay).await;
        Ok(ctx.with_output(&self.name, json!("done")))
    }

    async fn cleanup(&self, _ctx: &PipelineContext) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// A stage that appends its name to a shared journal when it runs.
#[derive(Debug)]
pub struct RecordingStage {
    name: String,
    journal: Arc<Mutex<Vec<String>>>,
}

impl RecordingStage {
    /// Creates a recording stage writing to `journal`.
    #[must_use]
    pub fn new(name: impl Into<String>, journal: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.into(),
            journal,
        }
    }
}

#[async_trait]
impl Stage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &PipelineContext) -> Result<PipelineContext, StageError> {
        self.journal.lock().push(self.name.clone());
        Ok(ctx.with_output(&self.name, json!(true)))
    }
}
