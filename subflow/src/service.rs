//! Process-level wiring of the streaming system.
//!
//! [`StreamingService`] owns explicit handles to the queue, orchestrator,
//! metrics and health registry, and runs the watcher, the maintenance task
//! and the worker pool as tasks of one [`StructuredTaskGroup`]. Nothing is
//! global: two services in one process are independent.

use crate::cancellation::StructuredTaskGroup;
use crate::config::StreamingConfig;
use crate::errors::ConfigurationError;
use crate::events::LoggingEventSink;
use crate::health::{
    disk_space_probe, queue_backlog_probe, worker_liveness_probe, AggregatedHealth, DiskMonitor,
    HealthChecker, MetricsCollector,
};
use crate::pipeline::{PipelineBuilder, PipelineOrchestrator, StageRegistry};
use crate::streaming::{MaintenanceTask, StreamingWatcher, StreamingWorker, SubbandQueue, WorkerPool};
use anyhow::{anyhow, bail, Context, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// A running (or ready to run) streaming pipeline.
#[derive(Debug)]
pub struct StreamingService {
    config: StreamingConfig,
    queue: SubbandQueue,
    orchestrator: Arc<PipelineOrchestrator>,
    metrics: Arc<MetricsCollector>,
    health: Arc<HealthChecker>,
    disk: Option<Arc<DiskMonitor>>,
    tasks: StructuredTaskGroup,
    pool: Option<WorkerPool>,
}

impl StreamingService {
    /// Validates `config`, opens the queue database and builds the pipeline.
    pub fn new(config: StreamingConfig, registry: &StageRegistry) -> Result<Self> {
        config.validate().context("invalid streaming configuration")?;
        let queue = SubbandQueue::open(&config.queue_db, config.queue.clone())
            .with_context(|| format!("cannot open queue at {}", config.queue_db.display()))?;
        Self::with_queue(config, queue, registry)
    }

    /// Like [`new`](Self::new) but with an already opened queue.
    pub fn with_queue(config: StreamingConfig, queue: SubbandQueue, registry: &StageRegistry) -> Result<Self> {
        config.validate().context("invalid streaming configuration")?;
        let orchestrator = build_orchestrator(&config, registry).context("cannot build pipeline")?;
        let metrics = Arc::new(MetricsCollector::new());

        let health = Arc::new(HealthChecker::new());
        health.register_check(
            "queue",
            queue_backlog_probe(queue.clone(), config.health.max_backlog, config.health.max_wait),
        );
        health.register_check(
            "worker",
            worker_liveness_probe(metrics.clone(), config.health.max_worker_silence),
        );
        let disk = config
            .disk
            .is_enabled()
            .then(|| Arc::new(DiskMonitor::new(config.disk.clone())));
        if let Some(monitor) = &disk {
            health.register_check("disk", disk_space_probe(monitor.clone(), metrics.clone()));
        }

        info!(
            pipeline = %orchestrator.name(),
            stages = ?orchestrator.execution_order(),
            queue_db = %config.queue_db.display(),
            workers = config.workers,
            "Streaming service configured"
        );

        Ok(Self {
            config,
            queue,
            orchestrator: Arc::new(orchestrator),
            metrics,
            health,
            disk,
            tasks: StructuredTaskGroup::new(),
            pool: None,
        })
    }

    /// The queue handle.
    #[must_use]
    pub fn queue(&self) -> &SubbandQueue {
        &self.queue
    }

    /// The pipeline orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<PipelineOrchestrator> {
        &self.orchestrator
    }

    /// The metrics collector.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// The health registry. Embedders may register extra probes.
    #[must_use]
    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    /// The effective configuration.
    #[must_use]
    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Runs every registered probe.
    pub fn health_report(&self) -> AggregatedHealth {
        self.health.run_all()
    }

    /// Renders the metrics in Prometheus text format.
    pub fn metrics_text(&self) -> String {
        self.metrics.to_prometheus()
    }

    /// Whether [`start`](Self::start) has been called.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.pool.is_some()
    }

    /// Spawns the watcher, the maintenance task and the worker pool.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.pool.is_some() {
            bail!("streaming service already started");
        }
        let input_dir = &self.config.watcher.input_dir;
        std::fs::create_dir_all(input_dir)
            .with_context(|| format!("cannot create input directory {}", input_dir.display()))?;

        let watcher = StreamingWatcher::new(self.queue.clone(), self.config.watcher.clone())
            .with_metrics(self.metrics.clone());
        self.tasks.spawn("watcher", move |token| watcher.run(token));

        let maintenance = MaintenanceTask::new(
            self.queue.clone(),
            self.metrics.clone(),
            self.config.maintenance.clone(),
        );
        self.tasks.spawn("maintenance", move |token| maintenance.run(token));

        let mut template = StreamingWorker::new(
            self.queue.clone(),
            self.orchestrator.clone(),
            self.metrics.clone(),
            self.config.worker.clone(),
        )
        .with_pipeline_config(self.config.pipeline_config.clone());
        if let Some(monitor) = &self.disk {
            template = template.with_disk_monitor(monitor.clone());
        }
        self.pool = Some(WorkerPool::spawn(self.config.workers, &template, self.tasks.cancel_token()));
        info!(input_dir = %input_dir.display(), "Streaming service started");
        Ok(())
    }

    /// Asks every task to stop. Workers finish or release their current group.
    pub fn shutdown(&self, reason: &str) {
        info!(reason, "Streaming service shutting down");
        self.tasks.cancel_all(reason);
    }

    /// Waits for every task to exit.
    pub async fn wait(&self) -> Result<()> {
        let pool = match &self.pool {
            Some(pool) => pool.wait().await,
            None => Ok(()),
        };
        let tasks = self.tasks.wait().await;
        if let Err(e) = &pool {
            warn!(error = %e, "Worker pool exited with an error");
        }
        pool.and(tasks).map_err(|e| anyhow!(e))
    }

    /// Starts the service, runs until `signal` resolves, then shuts down and
    /// waits for the tasks to drain.
    pub async fn run_until<F>(mut self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.start()?;
        signal.await;
        self.shutdown("shutdown requested");
        self.wait().await
    }
}

fn build_orchestrator(
    config: &StreamingConfig,
    registry: &StageRegistry,
) -> Result<PipelineOrchestrator, ConfigurationError> {
    PipelineBuilder::new(config.pipeline_name.clone())
        .from_configs(registry, &config.stages)?
        .event_sink(Arc::new(LoggingEventSink::debug()))
        .build()
}
