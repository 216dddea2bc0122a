//! Workers that claim groups and drive them through the pipeline.

use super::maintenance::refresh_queue_gauges;
use super::queue::{Group, SubbandQueue};
use crate::cancellation::{CancellationToken, StructuredTaskGroup};
use crate::context::{PipelineContext, ValueMap};
use crate::core::PipelineStatus;
use crate::errors::{ConfigurationError, ErrorKind, QueueResult, StageError};
use crate::health::{ComponentStatus, DiskMonitor, MetricsCollector};
use crate::pipeline::{with_retry, PipelineOrchestrator, PipelineResult, RetryPolicy};
use crate::utils::duration::secs;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::future::ready;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Identifies this worker in leases and logs.
    pub worker_id: String,
    /// Sleep between claim attempts when the queue is empty.
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    /// Lease length. The lease is renewed every third of this.
    #[serde(with = "secs")]
    pub lease: Duration,
    /// Retry policy for marking groups complete or failed.
    pub finalize_retry: RetryPolicy,
    /// Check that every file exists and is non-empty before running.
    pub verify_files: bool,
    /// Sleep after a queue error before trying again.
    #[serde(with = "secs")]
    pub error_backoff: Duration,
    /// Sleep while a monitored volume is below its critical threshold.
    #[serde(with = "secs")]
    pub disk_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4().simple()),
            poll_interval: Duration::from_secs(5),
            lease: Duration::from_secs(600),
            finalize_retry: RetryPolicy::new()
                .with_max_attempts(5)
                .with_initial_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(5))
                .with_retryable_kinds([ErrorKind::Database]),
            verify_files: true,
            error_backoff: Duration::from_secs(2),
            disk_backoff: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    /// Sets the worker id.
    #[must_use]
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Sets the idle poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the lease length.
    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Enables or disables file verification.
    #[must_use]
    pub fn with_verify_files(mut self, verify: bool) -> Self {
        self.verify_files = verify;
        self
    }

    /// Checks the settings.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.worker_id.trim().is_empty() {
            return Err(ConfigurationError::invalid("worker.worker_id", "must not be blank"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigurationError::invalid("worker.poll_interval", "must be greater than zero"));
        }
        if self.disk_backoff.is_zero() {
            return Err(ConfigurationError::invalid("worker.disk_backoff", "must be greater than zero"));
        }
        if self.lease < Duration::from_secs(1) {
            return Err(ConfigurationError::invalid("worker.lease", "must be at least one second"));
        }
        self.finalize_retry.validate()
    }
}

impl PipelineContext {
    /// Builds the context for processing `group`.
    ///
    /// Inputs: `group_id`, `files` (subband order), `subband_indices`,
    /// `subband_count`, `expected_subbands`, `partial` and `group_fingerprint`.
    #[must_use]
    pub fn for_group(group: &Group, config: ValueMap) -> Self {
        let files: Vec<String> = group
            .arrived
            .values()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let indices: Vec<u32> = group.arrived.keys().copied().collect();

        let inputs: ValueMap = [
            ("group_id", json!(group.group_id)),
            ("files", json!(files)),
            ("subband_indices", json!(indices)),
            ("subband_count", json!(group.subband_count())),
            ("expected_subbands", json!(group.expected_subbands)),
            ("partial", json!(group.partial || !group.is_complete())),
            ("group_fingerprint", json!(group_fingerprint(group))),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let ctx = Self::new(config, inputs);
        let identity = ctx.identity().clone().with_group_id(&group.group_id);
        ctx.with_identity(identity)
    }
}

/// SHA-256 over the group id and its `(index, path)` pairs, hex encoded.
///
/// Stages can key their outputs on it so a reclaimed group overwrites the
/// products of an earlier attempt instead of duplicating them.
#[must_use]
pub fn group_fingerprint(group: &Group) -> String {
    let mut hasher = Sha256::new();
    hasher.update(group.group_id.as_bytes());
    for (index, path) in &group.arrived {
        hasher.update(b"\n");
        hasher.update(index.to_le_bytes());
        hasher.update(path.to_string_lossy().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Returns `(index, path, problem)` for each file that is missing, unreadable
/// or empty.
#[must_use]
pub fn validate_group_files(group: &Group) -> Vec<(u32, PathBuf, String)> {
    group
        .arrived
        .iter()
        .filter_map(|(index, path)| {
            let problem = match std::fs::metadata(path) {
                Err(e) => Some(format!("not accessible: {e}")),
                Ok(meta) if !meta.is_file() => Some("not a regular file".to_string()),
                Ok(meta) if meta.len() == 0 => Some("empty".to_string()),
                Ok(_) => std::fs::File::open(path)
                    .err()
                    .map(|e| format!("not readable: {e}")),
            };
            problem.map(|p| (*index, path.clone(), p))
        })
        .collect()
}

/// How a claimed group ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    /// Marked complete. `partial` is true when some stages did not complete.
    Completed {
        /// Whether the pipeline ended partial.
        partial: bool,
    },
    /// Marked failed with this error.
    Failed(String),
    /// Handed back to `pending` because of shutdown.
    Released,
    /// Another worker took over the group; nothing was written.
    LeaseLost,
}

/// Claims groups and runs them through the orchestrator.
///
/// Cloning yields a worker with the same queue, pipeline and settings.
#[derive(Debug, Clone)]
pub struct StreamingWorker {
    queue: SubbandQueue,
    orchestrator: Arc<PipelineOrchestrator>,
    metrics: Arc<MetricsCollector>,
    config: WorkerConfig,
    pipeline_config: ValueMap,
    disk: Option<Arc<DiskMonitor>>,
}

impl StreamingWorker {
    /// Creates a worker.
    #[must_use]
    pub fn new(
        queue: SubbandQueue,
        orchestrator: Arc<PipelineOrchestrator>,
        metrics: Arc<MetricsCollector>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            metrics,
            config,
            pipeline_config: ValueMap::new(),
            disk: None,
        }
    }

    /// Sets the static config passed to every run's context.
    #[must_use]
    pub fn with_pipeline_config(mut self, config: ValueMap) -> Self {
        self.pipeline_config = config;
        self
    }

    /// Pauses claiming while `monitor` reports a critical volume.
    #[must_use]
    pub fn with_disk_monitor(mut self, monitor: Arc<DiskMonitor>) -> Self {
        self.disk = Some(monitor);
        self
    }

    /// Sets the worker id.
    #[must_use]
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.config.worker_id = id.into();
        self
    }

    /// Returns the worker id.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Claims and processes groups until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) -> Result<(), String> {
        let worker_id = self.config.worker_id.clone();
        info!(worker_id = %worker_id, pipeline = %self.orchestrator.name(), "Worker started");
        self.metrics.set_worker_status(ComponentStatus::Idle);

        while !token.is_cancelled() {
            if let Err(e) = self.check_disk() {
                error!(worker_id = %worker_id, error = %e, "Disk space critical; pausing claims");
                self.metrics.record_error(format!("disk: {e}"));
                self.metrics.worker_heartbeat();
                pause(&token, self.config.disk_backoff).await;
                continue;
            }

            match self.queue.claim_next(&worker_id, self.config.lease) {
                Ok(Some(group)) => {
                    self.metrics.set_worker_status(ComponentStatus::Running);
                    let group_id = group.group_id.clone();
                    let processed = self.process_group(group, &token).await;
                    refresh_queue_gauges(&self.queue, &self.metrics);
                    match processed {
                        Ok(outcome) => debug!(worker_id = %worker_id, group_id = %group_id, ?outcome, "Group done"),
                        Err(e) => {
                            error!(worker_id = %worker_id, group_id = %group_id, error = %e, "Could not record group outcome");
                            self.metrics.record_error(format!("{group_id}: {e}"));
                            pause(&token, self.config.error_backoff).await;
                        }
                    }
                    self.metrics.set_worker_status(ComponentStatus::Idle);
                }
                Ok(None) => {
                    self.metrics.worker_heartbeat();
                    pause(&token, self.config.poll_interval).await;
                }
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "Claim failed");
                    self.metrics.record_error(format!("claim: {e}"));
                    pause(&token, self.config.error_backoff).await;
                }
            }
        }

        info!(worker_id = %worker_id, "Worker stopped");
        self.metrics.set_worker_status(ComponentStatus::Stopped);
        Ok(())
    }

    /// Runs a claimed group and records the outcome in the queue.
    ///
    /// # Errors
    ///
    /// Returns the queue error if the outcome could not be recorded after
    /// retrying.
    pub async fn process_group(&self, group: Group, token: &CancellationToken) -> QueueResult<GroupOutcome> {
        let started = Instant::now();
        let group_id = group.group_id.clone();
        info!(
            worker_id = %self.config.worker_id,
            group_id = %group_id,
            subbands = group.subband_count(),
            expected = group.expected_subbands,
            partial = group.partial,
            "Processing group"
        );

        let group = match self.screen_files(group) {
            Ok(group) => group,
            Err(message) => return self.finish_failed(&group_id, message).await,
        };

        let run_token = token.child();
        let ctx = PipelineContext::for_group(&group, self.pipeline_config.clone());
        let ctx = ctx.with_identity(ctx.identity().clone().with_worker_id(&self.config.worker_id));
        let (result, lease_lost) = self.run_with_lease(&group_id, ctx, &run_token).await;

        self.metrics.record_processing_time(started.elapsed());
        self.metrics.add_stage_retries(result.retries());

        if lease_lost {
            return Ok(self.lease_lost(&group_id));
        }

        if token.is_cancelled() && result.status != PipelineStatus::Completed {
            if !self.queue.release(&group_id, &self.config.worker_id)? {
                return Ok(self.lease_lost(&group_id));
            }
            return Ok(GroupOutcome::Released);
        }

        match result.status {
            PipelineStatus::Completed => {
                if !self.finalize(&group_id, None).await? {
                    return Ok(self.lease_lost(&group_id));
                }
                self.metrics.increment_processed();
                info!(group_id = %group_id, elapsed_s = started.elapsed().as_secs_f64(), "Group complete");
                Ok(GroupOutcome::Completed { partial: false })
            }
            PipelineStatus::Partial => {
                let incomplete = incomplete_stages(&result);
                if !self.finalize(&group_id, None).await? {
                    return Ok(self.lease_lost(&group_id));
                }
                self.metrics.increment_processed();
                self.metrics.increment_partial();
                warn!(group_id = %group_id, stages = ?incomplete, "Group complete with partial pipeline");
                Ok(GroupOutcome::Completed { partial: true })
            }
            PipelineStatus::Failed => {
                let message = result
                    .error
                    .as_ref()
                    .map_or_else(|| "pipeline failed".to_string(), ToString::to_string);
                self.finish_failed(&group_id, message).await
            }
        }
    }

    fn screen_files(&self, mut group: Group) -> Result<Group, String> {
        if group.arrived.is_empty() {
            return Err("no files recorded for group".to_string());
        }
        if !self.config.verify_files {
            return Ok(group);
        }
        let problems = validate_group_files(&group);
        if problems.len() == group.arrived.len() {
            return Err(format!("all {} files are unusable", problems.len()));
        }
        for (index, path, problem) in problems {
            warn!(group_id = %group.group_id, subband = index, path = %path.display(), problem = %problem, "Dropping unusable subband");
            group.arrived.remove(&index);
            group.partial = true;
        }
        Ok(group)
    }

    async fn run_with_lease(
        &self,
        group_id: &str,
        ctx: PipelineContext,
        run_token: &CancellationToken,
    ) -> (PipelineResult, bool) {
        let period = (self.config.lease / 3).max(Duration::from_millis(10));
        let mut renew = tokio::time::interval_at(Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let run = self.orchestrator.execute_with_cancellation(ctx, run_token.clone());
        tokio::pin!(run);
        let mut lease_lost = false;

        loop {
            tokio::select! {
                result = &mut run => return (result, lease_lost),
                _ = renew.tick(), if !lease_lost => {
                    match self.queue.renew_lease(group_id, &self.config.worker_id, self.config.lease) {
                        Ok(true) => self.metrics.worker_heartbeat(),
                        Ok(false) => {
                            lease_lost = true;
                            warn!(group_id, worker_id = %self.config.worker_id, "Lease renewal refused; cancelling run");
                            run_token.cancel("lease lost");
                        }
                        Err(e) => warn!(group_id, error = %e, "Lease renewal failed"),
                    }
                }
            }
        }
    }

    fn check_disk(&self) -> Result<(), StageError> {
        match &self.disk {
            Some(monitor) => DiskMonitor::ensure_capacity(&monitor.record(&self.metrics)),
            None => Ok(()),
        }
    }

    fn lease_lost(&self, group_id: &str) -> GroupOutcome {
        warn!(worker_id = %self.config.worker_id, group_id, "Lease lost; leaving group to its new owner");
        GroupOutcome::LeaseLost
    }

    async fn finish_failed(&self, group_id: &str, message: String) -> QueueResult<GroupOutcome> {
        if !self.finalize(group_id, Some(&message)).await? {
            return Ok(self.lease_lost(group_id));
        }
        self.metrics.increment_failed();
        self.metrics.record_error(format!("{group_id}: {message}"));
        error!(group_id, error = %message, "Group failed");
        Ok(GroupOutcome::Failed(message))
    }

    /// Returns `false` if the lease was no longer held and nothing was written.
    async fn finalize(&self, group_id: &str, error: Option<&str>) -> QueueResult<bool> {
        // Finalisation must land even while shutting down.
        let never = CancellationToken::new();
        let worker_id = self.config.worker_id.as_str();
        with_retry(&self.config.finalize_retry, "finalize_group", &never, |_| {
            ready(match error {
                None => self.queue.complete_owned(group_id, worker_id),
                Some(message) => self.queue.fail_owned(group_id, worker_id, message),
            })
        })
        .await
    }
}

fn incomplete_stages(result: &PipelineResult) -> Vec<&str> {
    result
        .stage_results
        .iter()
        .filter(|r| r.status != crate::core::StageStatus::Completed)
        .map(|r| r.name.as_str())
        .collect()
}

async fn pause(token: &CancellationToken, duration: Duration) {
    tokio::select! {
        () = tokio::time::sleep(duration) => {}
        _ = token.cancelled() => {}
    }
}

/// A set of workers sharing one queue and orchestrator.
#[derive(Debug)]
pub struct WorkerPool {
    tasks: StructuredTaskGroup,
    worker_ids: Vec<String>,
}

impl WorkerPool {
    /// Spawns `count` clones of `template`. Ids are `<template id>-<n>`.
    ///
    /// The pool stops when `token` (or the pool itself) is cancelled.
    #[must_use]
    pub fn spawn(count: usize, template: &StreamingWorker, token: &CancellationToken) -> Self {
        let tasks = StructuredTaskGroup::with_token(token.child());
        let mut worker_ids = Vec::with_capacity(count);
        for n in 0..count {
            let id = format!("{}-{n}", template.worker_id());
            let worker = template.clone().with_worker_id(id.clone());
            tasks.spawn(id.clone(), move |t| worker.run(t));
            worker_ids.push(id);
        }
        info!(workers = count, "Worker pool started");
        Self { tasks, worker_ids }
    }

    /// Ids of the pool's workers.
    #[must_use]
    pub fn worker_ids(&self) -> &[String] {
        &self.worker_ids
    }

    /// Asks every worker to stop after its current group.
    pub fn shutdown(&self, reason: &str) {
        self.tasks.cancel_all(reason);
    }

    /// Waits for every worker to exit.
    pub async fn wait(&self) -> Result<(), String> {
        self.tasks.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::disk::fake::FakeDiskSpace;
    use crate::health::{DiskQuota, DiskSettings};
    use crate::streaming::{GroupState, QueueSettings};
    use crate::testing::memory_queue;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn group(files: &[(u32, &str)]) -> Group {
        let now = chrono::Utc::now();
        Group {
            group_id: "2025-10-02T00:12:00".to_string(),
            state: GroupState::Processing,
            expected_subbands: 4,
            arrived: files.iter().map(|(i, p)| (*i, PathBuf::from(p))).collect::<BTreeMap<_, _>>(),
            partial: false,
            chunk_duration: Duration::from_secs(300),
            received_at: now,
            last_update: now,
            lease_owner: None,
            lease_expires_at: None,
            retry_count: 0,
            claim_count: 1,
            error: None,
        }
    }

    #[test]
    fn test_for_group_inputs() {
        let g = group(&[(2, "/in/sb02.hdf5"), (0, "/in/sb00.hdf5")]);
        let ctx = PipelineContext::for_group(&g, ValueMap::new());

        assert_eq!(ctx.get_input("group_id"), Some(&json!("2025-10-02T00:12:00")));
        assert_eq!(ctx.get_input("files"), Some(&json!(["/in/sb00.hdf5", "/in/sb02.hdf5"])));
        assert_eq!(ctx.get_input("subband_indices"), Some(&json!([0, 2])));
        assert_eq!(ctx.get_input("subband_count"), Some(&json!(2)));
        assert_eq!(ctx.get_input("partial"), Some(&json!(true)));
        assert_eq!(ctx.identity().group_id.as_deref(), Some("2025-10-02T00:12:00"));
    }

    #[test]
    fn test_fingerprint_tracks_file_set() {
        let a = group(&[(0, "/in/sb00.hdf5"), (1, "/in/sb01.hdf5")]);
        let b = group(&[(0, "/in/sb00.hdf5"), (1, "/in/sb01.hdf5")]);
        let c = group(&[(0, "/in/sb00.hdf5")]);

        assert_eq!(group_fingerprint(&a), group_fingerprint(&b));
        assert_ne!(group_fingerprint(&a), group_fingerprint(&c));
        assert_eq!(group_fingerprint(&a).len(), 64);
    }

    #[test]
    fn test_validate_group_files() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.hdf5");
        let empty = dir.path().join("empty.hdf5");
        std::fs::write(&good, b"data").unwrap();
        std::fs::write(&empty, b"").unwrap();
        let missing = dir.path().join("missing.hdf5");

        let g = group(&[
            (0, good.to_str().unwrap()),
            (1, empty.to_str().unwrap()),
            (2, missing.to_str().unwrap()),
        ]);
        let problems = validate_group_files(&g);
        let indices: Vec<u32> = problems.iter().map(|(i, _, _)| *i).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(problems[0].2, "empty");
    }

    #[test]
    fn test_worker_config_validation() {
        assert!(WorkerConfig::default().validate().is_ok());
        assert!(WorkerConfig::default().with_worker_id(" ").validate().is_err());
        assert!(WorkerConfig::default().with_lease(Duration::ZERO).validate().is_err());
        assert_ne!(WorkerConfig::default().worker_id, WorkerConfig::default().worker_id);
    }

    #[tokio::test]
    async fn test_unusable_files_fail_group() {
        let (queue, _) = memory_queue(QueueSettings::default().with_expected_subbands(1)).unwrap();
        queue
            .record_subband("2025-10-02T00:12:00", 0, Path::new("/nonexistent/sb00.hdf5"))
            .unwrap();
        let orchestrator = Arc::new(
            crate::pipeline::PipelineBuilder::new("p")
                .stage("noop", Arc::new(crate::stages::NoOpStage::new("noop")), &[])
                .build()
                .unwrap(),
        );
        let worker = StreamingWorker::new(
            queue.clone(),
            orchestrator,
            Arc::new(MetricsCollector::new()),
            WorkerConfig::default().with_worker_id("w"),
        );

        let claimed = queue.claim_next("w", Duration::from_secs(60)).unwrap().unwrap();
        let outcome = worker.process_group(claimed, &CancellationToken::new()).await.unwrap();

        assert!(matches!(outcome, GroupOutcome::Failed(ref m) if m.contains("unusable")));
        let g = queue.group("2025-10-02T00:12:00").unwrap().unwrap();
        assert_eq!(g.state, GroupState::Failed);
        assert!(g.error.unwrap().contains("unusable"));
    }

    const G: &str = "2025-10-02T00:12:00";

    fn noop_orchestrator() -> Arc<PipelineOrchestrator> {
        Arc::new(
            crate::pipeline::PipelineBuilder::new("p")
                .stage("noop", Arc::new(crate::stages::NoOpStage::new("noop")), &[])
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_finalize_refused_after_lease_taken_over() {
        let (queue, clock) = memory_queue(QueueSettings::default().with_expected_subbands(1)).unwrap();
        queue.record_subband(G, 0, Path::new("/in/sb00.hdf5")).unwrap();

        let rival = queue.clone();
        let takeover = crate::stages::FnStage::new("imaging", move |ctx: &PipelineContext| {
            clock.advance(Duration::from_secs(700));
            assert!(rival.claim(G, "w2", Duration::from_secs(600)).unwrap());
            Ok(ctx.clone())
        });
        let orchestrator = Arc::new(
            crate::pipeline::PipelineBuilder::new("p")
                .stage("imaging", Arc::new(takeover), &[])
                .build()
                .unwrap(),
        );
        let metrics = Arc::new(MetricsCollector::new());
        let worker = StreamingWorker::new(
            queue.clone(),
            orchestrator,
            metrics.clone(),
            WorkerConfig::default().with_worker_id("w1").with_verify_files(false),
        );

        let claimed = queue.claim_next("w1", Duration::from_secs(600)).unwrap().unwrap();
        let outcome = worker.process_group(claimed, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, GroupOutcome::LeaseLost);
        let g = queue.group(G).unwrap().unwrap();
        assert_eq!(g.state, GroupState::Processing);
        assert_eq!(g.lease_owner.as_deref(), Some("w2"));
        assert_eq!(metrics.snapshot().groups_processed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_disk_pauses_claims() {
        let (queue, _) = memory_queue(QueueSettings::default().with_expected_subbands(1)).unwrap();
        queue.record_subband(G, 0, Path::new("/in/sb00.hdf5")).unwrap();

        let disk = Arc::new(FakeDiskSpace::default());
        disk.set_gb("/data/products", 2);
        let monitor = DiskMonitor::new(DiskSettings {
            output: Some(DiskQuota::new("/data/products", 50.0, 10.0)),
            scratch: None,
        })
        .with_source(disk.clone());

        let mut config = WorkerConfig::default()
            .with_worker_id("w")
            .with_verify_files(false)
            .with_poll_interval(Duration::from_secs(1));
        config.disk_backoff = Duration::from_secs(30);
        let metrics = Arc::new(MetricsCollector::new());
        let worker = StreamingWorker::new(queue.clone(), noop_orchestrator(), metrics.clone(), config)
            .with_disk_monitor(Arc::new(monitor));

        let token = CancellationToken::new();
        let handle = tokio::spawn(worker.run(token.clone()));

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(queue.group(G).unwrap().unwrap().state, GroupState::Pending);
        let snapshot = metrics.snapshot();
        assert!(snapshot.last_error.unwrap().starts_with("disk:"));
        assert_eq!(snapshot.output_disk_free_gb, Some(2.0));

        disk.set_gb("/data/products", 100);
        let mut state = None;
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            state = queue.group(G).unwrap().map(|g| g.state);
            if state == Some(GroupState::Complete) {
                break;
            }
        }
        token.cancel("test over");
        handle.await.unwrap().unwrap();

        assert_eq!(state, Some(GroupState::Complete));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.groups_processed, 1);
        assert_eq!(snapshot.queue_count(GroupState::Complete), 1);
        assert_eq!(snapshot.queue_count(GroupState::Pending), 0);
    }
}
