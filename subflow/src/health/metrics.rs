//! Pipeline counters and gauges.

use crate::streaming::{Clock, GroupState, SystemClock};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::Duration;

const MAX_TIMING_HISTORY: usize = 100;
const PREFIX: &str = "subflow";

/// Lifecycle status of a background component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    /// Not reported yet.
    #[default]
    Unknown,
    /// Doing work.
    Running,
    /// Waiting for work.
    Idle,
    /// Shut down.
    Stopped,
    /// Stopped because of an error.
    Error,
}

impl ComponentStatus {
    /// Returns the status as a string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point-in-time copy of all metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    /// Groups that reached `complete`.
    pub groups_processed: u64,
    /// Groups that reached `failed`.
    pub groups_failed: u64,
    /// Completed groups whose pipeline ended `partial`.
    pub groups_partial: u64,
    /// Groups requeued after failing.
    pub groups_retried: u64,
    /// Stage retries across all runs.
    pub stage_retries: u64,
    /// Subband files recorded by the watcher.
    pub subbands_recorded: u64,
    /// Groups per queue state at the last refresh.
    pub queue: BTreeMap<GroupState, u64>,
    /// Seconds spent on the most recent group.
    pub last_processing_time: f64,
    /// Mean seconds per group over recent history.
    pub avg_processing_time: f64,
    /// When the last group finished.
    pub last_group_completed_at: Option<DateTime<Utc>>,
    /// Worker status.
    pub worker_status: ComponentStatus,
    /// Last time any worker reported progress.
    pub last_worker_heartbeat: Option<DateTime<Utc>>,
    /// Watcher status.
    pub watcher_status: ComponentStatus,
    /// Last recorded error.
    pub last_error: Option<String>,
    /// When `last_error` was recorded.
    pub last_error_at: Option<DateTime<Utc>>,
    /// Free GB on the output volume, if monitored.
    pub output_disk_free_gb: Option<f64>,
    /// Free GB on the scratch volume, if monitored.
    pub scratch_disk_free_gb: Option<f64>,
}

impl PipelineMetrics {
    /// Groups in `state` at the last refresh.
    #[must_use]
    pub fn queue_count(&self, state: GroupState) -> u64 {
        self.queue.get(&state).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct Inner {
    metrics: PipelineMetrics,
    processing_times: VecDeque<f64>,
}

/// Thread-safe owner of [`PipelineMetrics`].
#[derive(Debug)]
pub struct MetricsCollector {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Creates a collector on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a collector on the given clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    /// Counts a completed group.
    pub fn increment_processed(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.metrics.groups_processed += 1;
        inner.metrics.last_group_completed_at = Some(now);
    }

    /// Counts a failed group.
    pub fn increment_failed(&self) {
        self.inner.lock().metrics.groups_failed += 1;
    }

    /// Counts a group completed with a partial pipeline.
    pub fn increment_partial(&self) {
        self.inner.lock().metrics.groups_partial += 1;
    }

    /// Counts a requeued group.
    pub fn increment_retried(&self) {
        self.inner.lock().metrics.groups_retried += 1;
    }

    /// Adds stage retries.
    pub fn add_stage_retries(&self, n: u32) {
        self.inner.lock().metrics.stage_retries += u64::from(n);
    }

    /// Adds recorded subbands.
    pub fn add_subbands_recorded(&self, n: usize) {
        self.inner.lock().metrics.subbands_recorded += n as u64;
    }

    /// Records how long a group took.
    pub fn record_processing_time(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let mut inner = self.inner.lock();
        inner.metrics.last_processing_time = secs;
        inner.processing_times.push_back(secs);
        while inner.processing_times.len() > MAX_TIMING_HISTORY {
            inner.processing_times.pop_front();
        }
        #[allow(clippy::cast_precision_loss)]
        let avg = inner.processing_times.iter().sum::<f64>() / inner.processing_times.len() as f64;
        inner.metrics.avg_processing_time = avg;
    }

    /// Replaces the queue gauges.
    pub fn update_queue_counts(&self, counts: &BTreeMap<GroupState, usize>) {
        self.inner.lock().metrics.queue = counts.iter().map(|(s, n)| (*s, *n as u64)).collect();
    }

    /// Replaces the disk gauges.
    pub fn update_disk_space(&self, output_free_gb: Option<f64>, scratch_free_gb: Option<f64>) {
        let mut inner = self.inner.lock();
        inner.metrics.output_disk_free_gb = output_free_gb;
        inner.metrics.scratch_disk_free_gb = scratch_free_gb;
    }

    /// Sets the worker status and refreshes the heartbeat.
    pub fn set_worker_status(&self, status: ComponentStatus) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.metrics.worker_status = status;
        inner.metrics.last_worker_heartbeat = Some(now);
    }

    /// Refreshes the worker heartbeat.
    pub fn worker_heartbeat(&self) {
        let now = self.clock.now();
        self.inner.lock().metrics.last_worker_heartbeat = Some(now);
    }

    /// Sets the watcher status.
    pub fn set_watcher_status(&self, status: ComponentStatus) {
        self.inner.lock().metrics.watcher_status = status;
    }

    /// Records an error message.
    pub fn record_error(&self, error: impl Into<String>) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.metrics.last_error = Some(error.into());
        inner.metrics.last_error_at = Some(now);
    }

    /// Returns the collector's clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Returns a copy of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> PipelineMetrics {
        self.inner.lock().metrics.clone()
    }

    /// Renders the metrics in Prometheus text exposition format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let m = self.snapshot();
        let mut out = String::new();

        let counters = [
            ("groups_processed_total", "Groups completed", m.groups_processed),
            ("groups_failed_total", "Groups failed", m.groups_failed),
            ("groups_partial_total", "Groups completed with a partial pipeline", m.groups_partial),
            ("groups_retried_total", "Failed groups requeued", m.groups_retried),
            ("stage_retries_total", "Stage retry attempts", m.stage_retries),
            ("subbands_recorded_total", "Subband files recorded", m.subbands_recorded),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {PREFIX}_{name} {help}");
            let _ = writeln!(out, "# TYPE {PREFIX}_{name} counter");
            let _ = writeln!(out, "{PREFIX}_{name} {value}");
        }

        let _ = writeln!(out, "# HELP {PREFIX}_queue_groups Groups per queue state");
        let _ = writeln!(out, "# TYPE {PREFIX}_queue_groups gauge");
        for state in GroupState::ALL {
            let _ = writeln!(
                out,
                "{PREFIX}_queue_groups{{state=\"{state}\"}} {}",
                m.queue_count(state)
            );
        }

        let _ = writeln!(out, "# HELP {PREFIX}_processing_time_seconds Processing time of the last group");
        let _ = writeln!(out, "# TYPE {PREFIX}_processing_time_seconds gauge");
        let _ = writeln!(out, "{PREFIX}_processing_time_seconds {:.3}", m.last_processing_time);
        let _ = writeln!(out, "# HELP {PREFIX}_processing_time_avg_seconds Mean processing time over recent groups");
        let _ = writeln!(out, "# TYPE {PREFIX}_processing_time_avg_seconds gauge");
        let _ = writeln!(out, "{PREFIX}_processing_time_avg_seconds {:.3}", m.avg_processing_time);

        let disks = [("output", m.output_disk_free_gb), ("scratch", m.scratch_disk_free_gb)];
        if disks.iter().any(|(_, free)| free.is_some()) {
            let _ = writeln!(out, "# HELP {PREFIX}_disk_free_gb Free disk space in GB");
            let _ = writeln!(out, "# TYPE {PREFIX}_disk_free_gb gauge");
            for (volume, free) in disks {
                if let Some(free) = free {
                    let _ = writeln!(out, "{PREFIX}_disk_free_gb{{path=\"{volume}\"}} {free:.2}");
                }
            }
        }

        let _ = writeln!(out, "# HELP {PREFIX}_component_up Component running or idle (1) or not (0)");
        let _ = writeln!(out, "# TYPE {PREFIX}_component_up gauge");
        for (component, status) in [("worker", m.worker_status), ("watcher", m.watcher_status)] {
            let up = u8::from(matches!(status, ComponentStatus::Running | ComponentStatus::Idle));
            let _ = writeln!(
                out,
                "{PREFIX}_component_up{{component=\"{component}\",status=\"{status}\"}} {up}"
            );
        }
        out
    }
}
