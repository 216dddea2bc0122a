//! Periodic queue housekeeping.
//!
//! Each tick flushes expired collecting groups, reclassifies expired leases as
//! stale, purges old terminal groups and refreshes the queue gauges.

use super::queue::SubbandQueue;
use crate::cancellation::CancellationToken;
use crate::errors::QueueResult;
use crate::health::MetricsCollector;
use crate::utils::duration::{secs, secs_opt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Maintenance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Time between ticks.
    #[serde(with = "secs")]
    pub interval: Duration,
    /// Terminal groups older than this are deleted. `None` keeps them forever.
    #[serde(with = "secs_opt")]
    pub retention: Option<Duration>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            retention: Some(Duration::from_secs(7 * 24 * 3600)),
        }
    }
}

/// What one maintenance tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Groups flushed to pending.
    pub flushed: Vec<String>,
    /// Groups whose lease expired.
    pub stale: Vec<String>,
    /// Terminal groups deleted.
    pub purged: usize,
}

/// Pushes the current per-state counts into the queue gauges.
///
/// Called after every queue transition made by this process; a failed count
/// is logged and the gauges keep their previous values.
pub fn refresh_queue_gauges(queue: &SubbandQueue, metrics: &MetricsCollector) {
    match queue.count_by_state() {
        Ok(counts) => metrics.update_queue_counts(&counts),
        Err(e) => warn!(error = %e, "Could not refresh queue gauges"),
    }
}

/// Runs queue housekeeping on an interval.
#[derive(Debug)]
pub struct MaintenanceTask {
    queue: SubbandQueue,
    metrics: Arc<MetricsCollector>,
    config: MaintenanceConfig,
}

impl MaintenanceTask {
    /// Creates a maintenance task.
    #[must_use]
    pub fn new(queue: SubbandQueue, metrics: Arc<MetricsCollector>, config: MaintenanceConfig) -> Self {
        Self {
            queue,
            metrics,
            config,
        }
    }

    /// Runs a single tick.
    pub fn run_once(&self) -> QueueResult<MaintenanceReport> {
        let flushed = self.queue.flush_expired()?;
        let stale = self.queue.mark_stale()?;
        let purged = match self.config.retention {
            Some(retention) => self.queue.purge_terminal(retention)?,
            None => 0,
        };
        self.metrics.update_queue_counts(&self.queue.count_by_state()?);

        let report = MaintenanceReport {
            flushed,
            stale,
            purged,
        };
        if report != MaintenanceReport::default() {
            info!(
                flushed = report.flushed.len(),
                stale = report.stale.len(),
                purged = report.purged,
                "Queue maintenance"
            );
        }
        Ok(report)
    }

    /// Ticks until `token` is cancelled. Tick failures are logged and retried
    /// on the next tick.
    pub async fn run(self, token: CancellationToken) -> Result<(), String> {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(interval_secs = self.config.interval.as_secs_f64(), "Maintenance task started");

        loop {
            tokio::select! {
                biased;
                reason = token.cancelled() => {
                    debug!(reason = %reason, "Maintenance task stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once() {
                        error!(error = %e, "Queue maintenance failed");
                        self.metrics.record_error(format!("maintenance: {e}"));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::{GroupState, ManualClock, QueueSettings};
    use crate::testing::memory_queue;
    use std::path::Path;

    #[test]
    fn test_run_once_flushes_marks_and_purges() {
        let settings = QueueSettings::default()
            .with_expected_subbands(2)
            .with_chunk_duration(Duration::from_secs(60))
            .with_flush_grace(Duration::from_secs(10));
        let (queue, clock) = memory_queue(settings).unwrap();
        let metrics = Arc::new(MetricsCollector::with_clock(clock.clone()));
        let task = MaintenanceTask::new(
            queue.clone(),
            metrics.clone(),
            MaintenanceConfig {
                interval: Duration::from_secs(1),
                retention: Some(Duration::from_secs(3600)),
            },
        );

        queue.record_subband("2025-10-02T00:00:00", 0, Path::new("/a_sb00.hdf5")).unwrap();
        queue.record_subband("2025-10-02T01:00:00", 0, Path::new("/b_sb00.hdf5")).unwrap();
        queue.record_subband("2025-10-02T01:00:00", 1, Path::new("/b_sb01.hdf5")).unwrap();
        assert!(queue.claim("2025-10-02T01:00:00", "w", Duration::from_secs(30)).unwrap());

        clock.advance(Duration::from_secs(71));
        let report = task.run_once().unwrap();
        assert_eq!(report.flushed, vec!["2025-10-02T00:00:00".to_string()]);
        assert_eq!(report.stale, vec!["2025-10-02T01:00:00".to_string()]);
        assert_eq!(report.purged, 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queue_count(GroupState::Pending), 1);
        assert_eq!(snapshot.queue_count(GroupState::Stale), 1);
    }

    #[test]
    fn test_retention_disabled_keeps_terminal_groups() {
        let (queue, clock) = memory_queue(QueueSettings::default().with_expected_subbands(1)).unwrap();
        let task = MaintenanceTask::new(
            queue.clone(),
            Arc::new(MetricsCollector::new()),
            MaintenanceConfig {
                interval: Duration::from_secs(1),
                retention: None,
            },
        );
        queue.record_subband("2025-10-02T00:00:00", 0, Path::new("/a.hdf5")).unwrap();
        queue.claim("2025-10-02T00:00:00", "w", Duration::from_secs(30)).unwrap();
        queue.complete("2025-10-02T00:00:00").unwrap();

        clock.advance(Duration::from_secs(30 * 24 * 3600));
        assert_eq!(task.run_once().unwrap().purged, 0);
        assert!(queue.group("2025-10-02T00:00:00").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let clock = Arc::new(ManualClock::default());
        let queue = crate::streaming::SubbandQueue::open_in_memory(QueueSettings::default())
            .unwrap()
            .with_clock(clock);
        let metrics = Arc::new(MetricsCollector::new());
        let task = MaintenanceTask::new(queue, metrics, MaintenanceConfig::default());

        let token = CancellationToken::new();
        let handle = tokio::spawn(task.run(token.clone()));
        tokio::time::sleep(Duration::from_secs(95)).await;
        token.cancel("test over");
        assert_eq!(handle.await.unwrap(), Ok(()));
    }
}
