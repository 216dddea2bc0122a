//! DAG pipeline orchestrator.
//!
//! Stages run strictly sequentially in topological order. Each stage runs
//! under its own retry policy and timeout, and `cleanup` follows every
//! started attempt.

use super::{DependencyGraph, StageDefinition};
use crate::cancellation::{run_bounded_cleanup, CancellationToken};
use crate::context::PipelineContext;
use crate::core::{PipelineStatus, StageStatus};
use crate::errors::{ConfigurationError, StageError};
use crate::events::{types, EventSink, LoggingEventSink};
use crate::utils::duration::secs;
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default bound on a single `cleanup` call.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// The outcome of one stage within a run.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    /// The stage name.
    pub name: String,
    /// Final status.
    pub status: StageStatus,
    /// Context after the stage; the input context if it did not complete.
    pub context: PipelineContext,
    /// The error that ended the stage, if any.
    pub error: Option<StageError>,
    /// Number of `execute` calls made.
    pub attempts: u32,
    /// Wall time spent on the stage including backoff.
    #[serde(with = "secs")]
    pub duration: Duration,
}

impl StageResult {
    fn not_run(name: &str, status: StageStatus, context: &PipelineContext, error: Option<StageError>) -> Self {
        Self {
            name: name.to_string(),
            status,
            context: context.clone(),
            error,
            attempts: 0,
            duration: Duration::ZERO,
        }
    }
}

/// The outcome of a whole pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    /// Aggregate status.
    pub status: PipelineStatus,
    /// Context after the last completed stage.
    pub context: PipelineContext,
    /// Per-stage results in execution order.
    pub stage_results: Vec<StageResult>,
    /// The error that decided a failed outcome.
    pub error: Option<StageError>,
    /// Total wall time.
    #[serde(with = "secs")]
    pub duration: Duration,
}

impl PipelineResult {
    /// Returns the result of a named stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stage_results.iter().find(|r| r.name == name)
    }

    /// Returns true if every stage completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Completed
    }

    /// Number of retries across all stages.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.stage_results
            .iter()
            .map(|r| r.attempts.saturating_sub(1))
            .sum()
    }

    /// Names of stages that ended with the given status.
    #[must_use]
    pub fn stages_with_status(&self, status: StageStatus) -> Vec<&str> {
        self.stage_results
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.name.as_str())
            .collect()
    }
}

/// Outcome of driving one stage through its attempts.
struct StageRun {
    status: StageStatus,
    context: Option<PipelineContext>,
    error: Option<StageError>,
    attempts: u32,
}

/// Executes a validated stage DAG.
pub struct PipelineOrchestrator {
    name: String,
    definitions: HashMap<String, StageDefinition>,
    graph: DependencyGraph,
    sink: Arc<dyn EventSink>,
    cleanup_timeout: Duration,
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("name", &self.name)
            .field("order", &self.graph.order())
            .field("cleanup_timeout", &self.cleanup_timeout)
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Builds an orchestrator from stage definitions in registration order.
    ///
    /// # Errors
    ///
    /// Rejects empty pipelines, duplicate names, unknown or self dependencies,
    /// and cycles before any stage runs.
    pub fn new(definitions: Vec<StageDefinition>) -> Result<Self, ConfigurationError> {
        let graph = DependencyGraph::build(&definitions)?;
        let definitions = definitions
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        Ok(Self {
            name: "pipeline".to_string(),
            definitions,
            graph,
            sink: Arc::new(LoggingEventSink::debug()),
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        })
    }

    /// Sets the pipeline name used in logs and events.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the bound on each `cleanup` call.
    #[must_use]
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the execution order.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        self.graph.order()
    }

    /// Runs the pipeline using the cancellation token already on `context`.
    pub async fn execute(&self, context: PipelineContext) -> PipelineResult {
        let token = context.cancellation().clone();
        self.run(context, token).await
    }

    /// Runs the pipeline under `token`.
    pub async fn execute_with_cancellation(
        &self,
        context: PipelineContext,
        token: CancellationToken,
    ) -> PipelineResult {
        let context = context.with_cancellation(token.clone());
        self.run(context, token).await
    }

    async fn run(&self, mut context: PipelineContext, token: CancellationToken) -> PipelineResult {
        let started = Instant::now();
        let run_id = context.identity().run_id.to_string();
        info!(pipeline = %self.name, run_id = %run_id, stages = self.graph.order().len(), "Pipeline started");
        self.sink.try_emit(
            types::PIPELINE_STARTED,
            Some(json!({"pipeline": self.name, "run_id": run_id, "stages": self.graph.order()})),
        );

        let mut results: Vec<StageResult> = Vec::with_capacity(self.graph.order().len());
        let mut statuses: HashMap<&str, StageStatus> = HashMap::new();
        let mut halted: Option<String> = None;
        let mut deciding_error: Option<StageError> = None;
        let mut first_error: Option<StageError> = None;

        for name in self.graph.order() {
            let def = &self.definitions[name];

            if halted.is_none() && token.is_cancelled() {
                let reason = token.reason().unwrap_or_else(|| "cancelled".to_string());
                halted = Some(format!("pipeline cancelled: {reason}"));
                deciding_error = Some(StageError::shutdown(reason));
            }

            if let Some(reason) = &halted {
                self.record_skip(name, reason, &context, &mut results, &mut statuses);
                continue;
            }

            if let Some(dep) = self
                .graph
                .dependencies_of(name)
                .into_iter()
                .flatten()
                .find(|d| statuses.get(d.as_str()) != Some(&StageStatus::Completed))
            {
                let reason = format!("dependency '{dep}' did not complete");
                self.record_skip(name, &reason, &context, &mut results, &mut statuses);
                continue;
            }

            let stage_started = Instant::now();
            let run = match def.stage.validate(&context) {
                Err(msg) => StageRun {
                    status: StageStatus::Failed,
                    context: None,
                    error: Some(StageError::validation(format!(
                        "stage '{name}' precondition failed: {msg}"
                    ))),
                    attempts: 0,
                },
                Ok(()) => self.run_stage(def, &context, &token).await,
            };
            let duration = stage_started.elapsed();

            statuses.insert(name.as_str(), run.status);
            match run.status {
                StageStatus::Completed => {
                    info!(pipeline = %self.name, stage = %name, attempts = run.attempts, duration_ms = duration.as_millis() as u64, "Stage completed");
                    self.sink.try_emit(
                        types::STAGE_COMPLETED,
                        Some(json!({"pipeline": self.name, "stage": name, "attempts": run.attempts, "duration_s": duration.as_secs_f64()})),
                    );
                }
                StageStatus::Cancelled => {
                    warn!(pipeline = %self.name, stage = %name, "Stage cancelled");
                    self.sink.try_emit(
                        types::STAGE_CANCELLED,
                        Some(json!({"pipeline": self.name, "stage": name, "attempts": run.attempts})),
                    );
                    halted = Some(format!("pipeline cancelled during stage '{name}'"));
                    deciding_error = run.error.clone();
                }
                _ => {
                    let error = run
                        .error
                        .clone()
                        .unwrap_or_else(|| StageError::internal("stage failed without an error"));
                    warn!(pipeline = %self.name, stage = %name, attempts = run.attempts, error = %error, "Stage failed");
                    self.sink.try_emit(
                        types::STAGE_FAILED,
                        Some(json!({"pipeline": self.name, "stage": name, "attempts": run.attempts, "error": error})),
                    );
                    first_error.get_or_insert_with(|| error.clone());
                    if !def.retry_policy.continue_on_failure {
                        halted = Some(format!("stage '{name}' failed"));
                        deciding_error = Some(error);
                    }
                }
            }

            let stage_context = run.context.unwrap_or_else(|| context.clone());
            if run.status == StageStatus::Completed {
                context = stage_context.clone();
            }
            results.push(StageResult {
                name: name.clone(),
                status: run.status,
                context: stage_context,
                error: run.error,
                attempts: run.attempts,
                duration,
            });
        }

        let completed = results.iter().filter(|r| r.status == StageStatus::Completed).count();
        let (status, error) = if halted.is_some() {
            (PipelineStatus::Failed, deciding_error.or(first_error))
        } else if completed == results.len() {
            (PipelineStatus::Completed, None)
        } else if completed == 0 {
            (PipelineStatus::Failed, first_error)
        } else {
            (PipelineStatus::Partial, None)
        };

        let duration = started.elapsed();
        info!(pipeline = %self.name, run_id = %run_id, status = %status, completed, total = results.len(), duration_ms = duration.as_millis() as u64, "Pipeline finished");
        self.sink.try_emit(
            types::PIPELINE_COMPLETED,
            Some(json!({"pipeline": self.name, "run_id": run_id, "status": status, "duration_s": duration.as_secs_f64()})),
        );

        PipelineResult {
            status,
            context,
            stage_results: results,
            error,
            duration,
        }
    }

    fn record_skip<'a>(
        &self,
        name: &'a str,
        reason: &str,
        context: &PipelineContext,
        results: &mut Vec<StageResult>,
        statuses: &mut HashMap<&'a str, StageStatus>,
    ) {
        debug!(pipeline = %self.name, stage = %name, reason = %reason, "Stage skipped");
        self.sink.try_emit(
            types::STAGE_SKIPPED,
            Some(json!({"pipeline": self.name, "stage": name, "reason": reason})),
        );
        statuses.insert(name, StageStatus::Skipped);
        results.push(StageResult::not_run(name, StageStatus::Skipped, context, None));
    }

    async fn run_stage(
        &self,
        def: &StageDefinition,
        context: &PipelineContext,
        token: &CancellationToken,
    ) -> StageRun {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.sink.try_emit(
                types::STAGE_STARTED,
                Some(json!({"pipeline": self.name, "stage": def.name, "attempt": attempt})),
            );

            let outcome = match self.attempt(def, context, token).await {
                Ok(next) => match def.stage.validate_outputs(&next) {
                    Ok(()) => Ok(next),
                    Err(msg) => Err(StageError::validation(format!(
                        "stage '{}' postcondition failed: {msg}",
                        def.name
                    ))),
                },
                Err(err) => Err(err),
            };

            let cleanup_ctx = outcome.as_ref().unwrap_or(context);
            run_bounded_cleanup(&def.name, self.cleanup_timeout, def.stage.cleanup(cleanup_ctx)).await;

            let err = match outcome {
                Ok(next) => {
                    return StageRun {
                        status: StageStatus::Completed,
                        context: Some(next.with_cancellation(token.clone())),
                        error: None,
                        attempts: attempt,
                    }
                }
                Err(err) => err,
            };

            if err.is_shutdown() {
                return StageRun {
                    status: StageStatus::Cancelled,
                    context: None,
                    error: Some(err),
                    attempts: attempt,
                };
            }

            if !def.retry_policy.should_retry(&err, attempt) {
                return StageRun {
                    status: StageStatus::Failed,
                    context: None,
                    error: Some(err),
                    attempts: attempt,
                };
            }

            let delay = def.retry_policy.get_delay(attempt);
            warn!(
                pipeline = %self.name,
                stage = %def.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Stage attempt failed, retrying"
            );
            self.sink.try_emit(
                types::STAGE_RETRYING,
                Some(json!({"pipeline": self.name, "stage": def.name, "attempt": attempt, "delay_s": delay.as_secs_f64(), "error": err})),
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                reason = token.cancelled() => {
                    return StageRun {
                        status: StageStatus::Cancelled,
                        context: None,
                        error: Some(StageError::shutdown(reason)),
                        attempts: attempt,
                    };
                }
            }
        }
    }

    /// One bounded, cancellable `execute` call. Panics become internal errors.
    ///
    /// The stage sees a per-attempt child of the run token, cancelled when the
    /// attempt times out, so blocking work polling `is_cancelled` stops before
    /// the next attempt starts.
    async fn attempt(
        &self,
        def: &StageDefinition,
        context: &PipelineContext,
        token: &CancellationToken,
    ) -> Result<PipelineContext, StageError> {
        let attempt_token = token.child();
        let attempt_context = context.with_cancellation(attempt_token.clone());
        let execution = AssertUnwindSafe(def.stage.execute(&attempt_context)).catch_unwind();
        let bounded = async {
            let joined = match def.timeout {
                Some(limit) => match tokio::time::timeout(limit, execution).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        attempt_token.cancel("stage timeout");
                        return Err(StageError::timeout(&def.name, limit));
                    }
                },
                None => execution.await,
            };
            joined.unwrap_or_else(|payload| {
                Err(StageError::internal(format!(
                    "stage '{}' panicked: {}",
                    def.name,
                    panic_message(payload.as_ref())
                )))
            })
        };

        tokio::select! {
            biased;
            reason = token.cancelled() => Err(StageError::shutdown(reason)),
            result = bounded => result,
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::stages::{FnStage, NoOpStage};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn noop(name: &str, deps: &[&str]) -> StageDefinition {
        StageDefinition::new(name, Arc::new(NoOpStage::new(name)))
            .with_dependencies(deps.iter().copied())
    }

    #[tokio::test]
    async fn test_all_stages_complete() {
        let orchestrator =
            PipelineOrchestrator::new(vec![noop("a", &[]), noop("b", &["a"])]).unwrap();
        let result = orchestrator.execute(PipelineContext::default()).await;

        assert_eq!(result.status, PipelineStatus::Completed);
        assert_eq!(result.stage_results.len(), 2);
        assert!(result.error.is_none());
        assert_eq!(result.retries(), 0);
    }

    #[tokio::test]
    async fn test_outputs_accumulate() {
        let write = StageDefinition::new(
            "write",
            Arc::new(FnStage::new("write", |ctx: &PipelineContext| {
                Ok(ctx.with_output("ms_path", json!("/data/g.ms")))
            })),
        );
        let read = StageDefinition::new(
            "read",
            Arc::new(FnStage::new("read", |ctx: &PipelineContext| {
                let path = ctx
                    .get_output("ms_path")
                    .cloned()
                    .ok_or_else(|| StageError::validation("missing ms_path"))?;
                Ok(ctx.with_output("image", json!(format!("{}.image", path.as_str().unwrap_or_default()))))
            })),
        )
        .with_dependency("write");

        let orchestrator = PipelineOrchestrator::new(vec![write, read]).unwrap();
        let result = orchestrator.execute(PipelineContext::default()).await;
        assert_eq!(result.context.get_output("image"), Some(&json!("/data/g.ms.image")));
    }

    #[tokio::test]
    async fn test_validation_failure_is_not_retried() {
        #[derive(Debug)]
        struct NeedsInput;

        #[async_trait::async_trait]
        impl crate::stages::Stage for NeedsInput {
            fn name(&self) -> &str {
                "needs_input"
            }
            fn validate(&self, ctx: &PipelineContext) -> Result<(), String> {
                ctx.get_input("files").map(|_| ()).ok_or_else(|| "no files".to_string())
            }
            async fn execute(&self, ctx: &PipelineContext) -> Result<PipelineContext, StageError> {
                Ok(ctx.clone())
            }
        }

        let orchestrator = PipelineOrchestrator::new(vec![
            StageDefinition::new("needs_input", Arc::new(NeedsInput)),
            noop("after", &[]),
        ])
        .unwrap();
        let result = orchestrator.execute(PipelineContext::default()).await;

        let stage = result.stage("needs_input").unwrap();
        assert_eq!(stage.status, StageStatus::Failed);
        assert_eq!(stage.attempts, 0);
        assert_eq!(stage.error.as_ref().unwrap().kind, crate::errors::ErrorKind::Validation);
        assert_eq!(result.stage("after").unwrap().status, StageStatus::Skipped);
        assert_eq!(result.status, PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn test_continue_on_failure_gives_partial() {
        let flaky = StageDefinition::new(
            "photometry",
            Arc::new(FnStage::new("photometry", |_: &PipelineContext| {
                Err(StageError::photometry("no sources", false))
            })),
        )
        .with_dependency("imaging")
        .with_retry_policy(crate::pipeline::RetryPolicy::none().with_continue_on_failure(true));

        let orchestrator = PipelineOrchestrator::new(vec![
            noop("imaging", &[]),
            flaky,
            noop("mosaic", &["photometry"]),
            noop("archive", &["imaging"]),
        ])
        .unwrap();
        let result = orchestrator.execute(PipelineContext::default()).await;

        assert_eq!(result.status, PipelineStatus::Partial);
        assert_eq!(result.stage("mosaic").unwrap().status, StageStatus::Skipped);
        assert_eq!(result.stage("archive").unwrap().status, StageStatus::Completed);
    }

    #[tokio::test]
    async fn test_panicking_stage_fails_cleanly() {
        let boom = StageDefinition::new(
            "boom",
            Arc::new(FnStage::new("boom", |_: &PipelineContext| -> Result<PipelineContext, StageError> {
                panic!("kaboom")
            })),
        );
        let orchestrator = PipelineOrchestrator::new(vec![boom]).unwrap();
        let result = orchestrator.execute(PipelineContext::default()).await;

        assert_eq!(result.status, PipelineStatus::Failed);
        let err = result.error.unwrap();
        assert_eq!(err.kind, crate::errors::ErrorKind::Internal);
        assert!(err.message.contains("kaboom"));
    }

    #[tokio::test]
    async fn test_events_emitted_in_order() {
        let sink = Arc::new(CollectingEventSink::new());
        let orchestrator = PipelineOrchestrator::new(vec![noop("a", &[])])
            .unwrap()
            .with_name("events")
            .with_event_sink(sink.clone());
        orchestrator.execute(PipelineContext::default()).await;

        assert_eq!(
            sink.event_types(),
            vec![
                types::PIPELINE_STARTED,
                types::STAGE_STARTED,
                types::STAGE_COMPLETED,
                types::PIPELINE_COMPLETED
            ]
        );
    }

    #[derive(Debug, Default)]
    struct BlockingPoller {
        observed: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait::async_trait]
    impl crate::stages::Stage for BlockingPoller {
        fn name(&self) -> &str {
            "calibration_solve"
        }

        async fn execute(&self, ctx: &PipelineContext) -> Result<PipelineContext, StageError> {
            let token = ctx.cancellation().clone();
            let observed = self.observed.clone();
            let _ = tokio::task::spawn_blocking(move || {
                let deadline = std::time::Instant::now() + Duration::from_secs(5);
                while std::time::Instant::now() < deadline {
                    if token.is_cancelled() {
                        observed.store(true, std::sync::atomic::Ordering::SeqCst);
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
            .await;
            Ok(ctx.clone())
        }
    }

    #[tokio::test]
    async fn test_timeout_signals_blocking_stage() {
        let stage = Arc::new(BlockingPoller::default());
        let observed = stage.observed.clone();
        let def = StageDefinition::new("calibration_solve", stage)
            .with_timeout(Duration::from_millis(50))
            .with_retry_policy(crate::pipeline::RetryPolicy::none());
        let orchestrator = PipelineOrchestrator::new(vec![def]).unwrap();

        let run_token = CancellationToken::new();
        let result = orchestrator
            .execute_with_cancellation(PipelineContext::default(), run_token.clone())
            .await;

        assert_eq!(result.status, PipelineStatus::Failed);
        assert_eq!(result.error.unwrap().kind, crate::errors::ErrorKind::Timeout);
        assert!(!run_token.is_cancelled());

        let mut seen = false;
        for _ in 0..100 {
            seen = observed.load(std::sync::atomic::Ordering::SeqCst);
            if seen {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen);
    }

    #[test]
    fn test_cycle_rejected_at_construction() {
        let err = PipelineOrchestrator::new(vec![noop("a", &["b"]), noop("b", &["a"])]).unwrap_err();
        assert!(matches!(err, ConfigurationError::CycleDetected { .. }));
    }
}
