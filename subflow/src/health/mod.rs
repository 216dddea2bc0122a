//! Health checks and pipeline metrics.
//!
//! [`HealthChecker`] holds named probes and caches their last results.
//! [`MetricsCollector`] owns the counters and gauges that workers, the watcher
//! and the maintenance task update, and renders them for Prometheus.
//! [`DiskMonitor`] checks free space on the output and scratch volumes.

mod checker;
pub(crate) mod disk;
mod metrics;
mod probes;

pub use checker::{AggregatedHealth, HealthCheck, HealthChecker, HealthProbe, HealthStatus};
pub use disk::{DiskLevel, DiskMonitor, DiskQuota, DiskReading, DiskSettings, DiskSpace, SystemDiskSpace};
pub use metrics::{ComponentStatus, MetricsCollector, PipelineMetrics};
pub use probes::{disk_space_probe, queue_backlog_probe, worker_liveness_probe};
