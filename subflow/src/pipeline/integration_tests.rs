//! End-to-end orchestrator scenarios.

#[cfg(test)]
mod tests {
    use crate::cancellation::CancellationToken;
    use crate::context::PipelineContext;
    use crate::core::{PipelineStatus, StageStatus};
    use crate::errors::{ErrorKind, StageError};
    use crate::events::{types, CollectingEventSink};
    use crate::pipeline::{PipelineBuilder, RetryPolicy, StageDefinition};
    use crate::stages::Stage;
    use crate::testing::{FailingStage, RecordingStage, ScriptedStage, SlowStage};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new()
            .with_jitter(0.0)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
    }

    fn def(stage: Arc<dyn Stage>, deps: &[&str]) -> StageDefinition {
        StageDefinition::new(stage.name().to_string(), stage)
            .with_dependencies(deps.iter().copied())
            .with_retry_policy(fast_policy())
    }

    #[tokio::test(start_paused = true)]
    async fn test_conversion_recovers_on_third_attempt() {
        let conversion = Arc::new(ScriptedStage::failing_with(
            "conversion",
            [
                StageError::conversion("hdf5 read failed", true),
                StageError::conversion("hdf5 read failed", true),
            ],
        ));
        let imaging = Arc::new(ScriptedStage::new("imaging"));

        let orchestrator = PipelineBuilder::new("continuum")
            .definition(def(conversion.clone(), &[]))
            .definition(def(imaging.clone(), &["conversion"]))
            .build()
            .unwrap();

        let result = orchestrator.execute(PipelineContext::default()).await;

        assert_eq!(result.status, PipelineStatus::Completed);
        let conv = result.stage("conversion").unwrap();
        assert_eq!(conv.attempts, 3);
        assert_eq!(conversion.call_count(), 3);
        assert_eq!(conversion.cleanup_count(), 3);
        // delay(1) + delay(2)
        assert!(conv.duration >= Duration::from_secs(3));
        assert!(conv.duration < Duration::from_millis(3100));
        assert_eq!(imaging.call_count(), 1);
        assert_eq!(result.retries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibration_exhaustion_skips_downstream() {
        let solve = Arc::new(FailingStage::new(
            "calibration_solve",
            StageError::calibration("no solutions converged", true),
        ));
        let apply = Arc::new(ScriptedStage::new("calibration_apply"));
        let imaging = Arc::new(ScriptedStage::new("imaging"));

        let orchestrator = PipelineBuilder::new("continuum")
            .definition(def(Arc::new(ScriptedStage::new("conversion")), &[]))
            .definition(def(solve.clone(), &["conversion"]))
            .definition(def(apply.clone(), &["calibration_solve"]))
            .definition(def(imaging.clone(), &["calibration_apply"]))
            .build()
            .unwrap();

        let result = orchestrator.execute(PipelineContext::default()).await;

        assert_eq!(result.status, PipelineStatus::Failed);
        assert_eq!(solve.call_count(), 3);
        assert_eq!(apply.call_count(), 0);
        assert_eq!(imaging.call_count(), 0);
        assert_eq!(
            result.stages_with_status(StageStatus::Skipped),
            vec!["calibration_apply", "imaging"]
        );
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Calibration);
        assert_eq!(error.message, "no solutions converged");
        assert!(result.context.get_output("conversion").is_some());
    }

    #[tokio::test]
    async fn test_dependency_order_respected() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let stage = |name: &str| -> Arc<dyn Stage> { Arc::new(RecordingStage::new(name, journal.clone())) };

        let orchestrator = PipelineBuilder::new("ordered")
            .stage("mosaic", stage("mosaic"), &["photometry", "imaging"])
            .stage("photometry", stage("photometry"), &["imaging"])
            .stage("imaging", stage("imaging"), &["conversion"])
            .stage("conversion", stage("conversion"), &[])
            .build()
            .unwrap();

        let result = orchestrator.execute(PipelineContext::default()).await;

        assert_eq!(result.status, PipelineStatus::Completed);
        assert_eq!(
            *journal.lock(),
            vec!["conversion", "imaging", "photometry", "mosaic"]
        );
        let names: Vec<&str> = result.stage_results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["conversion", "imaging", "photometry", "mosaic"]);
    }

    #[test]
    fn test_cycle_rejected_before_execution() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let err = PipelineBuilder::new("cyclic")
            .stage("a", Arc::new(RecordingStage::new("a", journal.clone())), &["b"])
            .stage("b", Arc::new(RecordingStage::new("b", journal.clone())), &["a"])
            .build()
            .unwrap_err();

        assert!(err.to_string().contains("Cycle detected"));
        assert!(journal.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_triggers_cleanup_and_retry() {
        let slow = Arc::new(SlowStage::new("imaging", Duration::from_secs(60)));
        let orchestrator = PipelineBuilder::new("timeouts")
            .definition(
                def(slow.clone(), &[])
                    .with_timeout(Duration::from_secs(5))
                    .with_retry_policy(fast_policy().with_max_attempts(2)),
            )
            .build()
            .unwrap();

        let result = orchestrator.execute(PipelineContext::default()).await;

        let imaging = result.stage("imaging").unwrap();
        assert_eq!(imaging.status, StageStatus::Failed);
        assert_eq!(imaging.attempts, 2);
        assert_eq!(imaging.error.as_ref().unwrap().kind, ErrorKind::Timeout);
        assert_eq!(slow.cleanup_count(), 2);
        assert_eq!(result.status, PipelineStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_mid_stage() {
        let slow = Arc::new(SlowStage::new("conversion", Duration::from_secs(600)));
        let after = Arc::new(ScriptedStage::new("imaging"));
        let sink = Arc::new(CollectingEventSink::new());
        let orchestrator = PipelineBuilder::new("cancel")
            .definition(def(slow.clone(), &[]))
            .definition(def(after.clone(), &["conversion"]))
            .event_sink(sink.clone())
            .build()
            .unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            canceller.cancel("service shutdown");
        });

        let result = orchestrator
            .execute_with_cancellation(PipelineContext::default(), token)
            .await;

        assert_eq!(result.status, PipelineStatus::Failed);
        assert_eq!(result.stage("conversion").unwrap().status, StageStatus::Cancelled);
        assert_eq!(result.stage("imaging").unwrap().status, StageStatus::Skipped);
        assert_eq!(slow.cleanup_count(), 1);
        assert_eq!(after.call_count(), 0);
        assert!(result.error.unwrap().is_shutdown());
        assert_eq!(sink.events_of_type(types::STAGE_CANCELLED).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let flaky = Arc::new(FailingStage::new(
            "conversion",
            StageError::conversion("nfs stall", true),
        ));
        let orchestrator = PipelineBuilder::new("backoff")
            .definition(
                def(flaky.clone(), &[]).with_retry_policy(
                    fast_policy()
                        .with_initial_delay(Duration::from_secs(30))
                        .with_max_delay(Duration::from_secs(60)),
                ),
            )
            .build()
            .unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel("stop");
        });

        let result = orchestrator
            .execute_with_cancellation(PipelineContext::default(), token)
            .await;

        let stage = result.stage("conversion").unwrap();
        assert_eq!(stage.status, StageStatus::Cancelled);
        assert_eq!(stage.attempts, 1);
        assert_eq!(flaky.call_count(), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_runs_nothing() {
        let stage = Arc::new(ScriptedStage::new("conversion"));
        let orchestrator = PipelineBuilder::new("precancelled")
            .definition(def(stage.clone(), &[]))
            .build()
            .unwrap();

        let token = CancellationToken::new();
        token.cancel("shutdown before start");
        let result = orchestrator
            .execute_with_cancellation(PipelineContext::default(), token)
            .await;

        assert_eq!(result.status, PipelineStatus::Failed);
        assert_eq!(stage.call_count(), 0);
        assert_eq!(result.stage("conversion").unwrap().status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn test_non_retryable_error_single_attempt() {
        let stage = Arc::new(FailingStage::new(
            "imaging",
            StageError::imaging("corrupt measurement set", false),
        ));
        let orchestrator = PipelineBuilder::new("permanent")
            .definition(def(stage.clone(), &[]))
            .build()
            .unwrap();

        let result = orchestrator.execute(PipelineContext::default()).await;
        assert_eq!(stage.call_count(), 1);
        assert_eq!(result.stage("imaging").unwrap().attempts, 1);
        assert_eq!(result.status, PipelineStatus::Failed);
    }
}
