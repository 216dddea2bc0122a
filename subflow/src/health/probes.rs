//! Built-in probes for the queue, the worker pool and disk space.

use super::{ComponentStatus, DiskLevel, DiskMonitor, HealthCheck, MetricsCollector};
use crate::streaming::{GroupState, SubbandQueue};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Reports queue backlog.
///
/// Degraded when more than `max_backlog` groups wait to be claimed or any
/// group is stale; unhealthy when the oldest waiting group has waited longer
/// than `max_wait` or the queue cannot be read.
pub fn queue_backlog_probe(
    queue: SubbandQueue,
    max_backlog: usize,
    max_wait: Duration,
) -> impl Fn() -> HealthCheck + Send + Sync + 'static {
    move || {
        const NAME: &str = "queue";
        let (counts, oldest) = match (queue.count_by_state(), queue.oldest_pending_age()) {
            (Ok(counts), Ok(oldest)) => (counts, oldest),
            (Err(e), _) | (_, Err(e)) => {
                return HealthCheck::unhealthy(NAME, format!("queue unavailable: {e}"));
            }
        };

        let count = |state: GroupState| counts.get(&state).copied().unwrap_or(0);
        let stale = count(GroupState::Stale);
        let waiting = count(GroupState::Pending) + stale;
        let oldest_secs = oldest.map(|d| d.as_secs_f64());

        let check = if oldest.is_some_and(|age| age > max_wait) {
            HealthCheck::unhealthy(
                NAME,
                format!("oldest waiting group has waited {:.0}s", oldest_secs.unwrap_or_default()),
            )
        } else if waiting > max_backlog {
            HealthCheck::degraded(NAME, format!("{waiting} groups waiting"))
        } else if stale > 0 {
            HealthCheck::degraded(NAME, format!("{stale} stale groups awaiting reclaim"))
        } else {
            HealthCheck::healthy(NAME)
        };

        counts
            .iter()
            .fold(check, |check, (state, n)| check.with_detail(state.as_str(), json!(n)))
            .with_detail("oldest_waiting_seconds", json!(oldest_secs))
    }
}

/// Reports whether workers are alive.
///
/// Unhealthy when the workers stopped on an error or have not reported
/// within `max_silence`; degraded before the first report or after a
/// clean stop.
pub fn worker_liveness_probe(
    metrics: Arc<MetricsCollector>,
    max_silence: Duration,
) -> impl Fn() -> HealthCheck + Send + Sync + 'static {
    move || {
        const NAME: &str = "worker";
        let snapshot = metrics.snapshot();
        let now = metrics.clock().now();
        let silence = snapshot
            .last_worker_heartbeat
            .and_then(|at| (now - at).to_std().ok());

        let check = match (snapshot.worker_status, silence) {
            (ComponentStatus::Error, _) => HealthCheck::unhealthy(
                NAME,
                snapshot
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "worker stopped on error".to_string()),
            ),
            (ComponentStatus::Stopped, _) => HealthCheck::degraded(NAME, "worker stopped"),
            (_, None) => HealthCheck::degraded(NAME, "no worker heartbeat yet"),
            (_, Some(silence)) if silence > max_silence => HealthCheck::unhealthy(
                NAME,
                format!("no worker heartbeat for {:.0}s", silence.as_secs_f64()),
            ),
            (_, Some(_)) => HealthCheck::healthy(NAME),
        };

        check
            .with_detail("status", json!(snapshot.worker_status))
            .with_detail("groups_processed", json!(snapshot.groups_processed))
            .with_detail("groups_failed", json!(snapshot.groups_failed))
    }
}

/// Reports free space on the monitored volumes and updates the disk gauges.
///
/// Unhealthy when any volume is below its critical threshold, degraded when
/// below its warning threshold or unreadable.
pub fn disk_space_probe(
    monitor: Arc<DiskMonitor>,
    metrics: Arc<MetricsCollector>,
) -> impl Fn() -> HealthCheck + Send + Sync + 'static {
    move || {
        const NAME: &str = "disk";
        let readings = monitor.record(&metrics);
        let describe = |level: DiskLevel| {
            readings
                .iter()
                .filter(|r| r.level == level)
                .map(|r| match r.free_gb {
                    Some(free) => format!("{} at {} has {free:.1} GB free", r.volume, r.path.display()),
                    None => format!("{} at {} is unreadable", r.volume, r.path.display()),
                })
                .collect::<Vec<_>>()
        };

        let critical = describe(DiskLevel::Critical);
        let uneasy: Vec<String> = describe(DiskLevel::Warning)
            .into_iter()
            .chain(describe(DiskLevel::Unknown))
            .collect();
        let check = if !critical.is_empty() {
            HealthCheck::unhealthy(NAME, critical.join("; "))
        } else if !uneasy.is_empty() {
            HealthCheck::degraded(NAME, uneasy.join("; "))
        } else {
            HealthCheck::healthy(NAME)
        };

        readings.iter().fold(check, |check, r| {
            check.with_detail(r.volume, json!({"free_gb": r.free_gb, "level": r.level}))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::disk::fake::FakeDiskSpace;
    use crate::health::{DiskQuota, DiskSettings, HealthChecker, HealthStatus};
    use crate::streaming::{ManualClock, QueueSettings};
    use crate::testing::memory_queue;
    use std::path::Path;

    #[test]
    fn test_queue_check_healthy_when_empty() {
        let (queue, _) = memory_queue(QueueSettings::default()).unwrap();
        let probe = queue_backlog_probe(queue, 10, Duration::from_secs(600));
        let check = probe();
        assert_eq!(check.status, HealthStatus::Healthy);
        assert_eq!(check.details["pending"], json!(0));
    }

    #[test]
    fn test_queue_check_flags_backlog_and_age() {
        let (queue, clock) = memory_queue(QueueSettings::default().with_expected_subbands(1)).unwrap();
        for hour in 0..3 {
            let gid = format!("2025-10-02T0{hour}:00:00");
            queue.record_subband(&gid, 0, Path::new(&format!("/x/{gid}.hdf5"))).unwrap();
        }

        let checker = HealthChecker::new();
        checker.register_check("queue", queue_backlog_probe(queue, 2, Duration::from_secs(600)));
        assert_eq!(checker.run_check("queue").unwrap().status, HealthStatus::Degraded);

        clock.advance(Duration::from_secs(601));
        assert_eq!(checker.run_check("queue").unwrap().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_worker_check_transitions() {
        let clock = Arc::new(ManualClock::default());
        let metrics = Arc::new(MetricsCollector::with_clock(clock.clone()));
        let probe = worker_liveness_probe(metrics.clone(), Duration::from_secs(60));

        assert_eq!(probe().status, HealthStatus::Degraded);

        metrics.set_worker_status(ComponentStatus::Idle);
        assert_eq!(probe().status, HealthStatus::Healthy);

        clock.advance(Duration::from_secs(61));
        assert_eq!(probe().status, HealthStatus::Unhealthy);

        metrics.worker_heartbeat();
        assert_eq!(probe().status, HealthStatus::Healthy);

        metrics.record_error("queue database error");
        metrics.set_worker_status(ComponentStatus::Error);
        let check = probe();
        assert_eq!(check.status, HealthStatus::Unhealthy);
        assert_eq!(check.message.as_deref(), Some("queue database error"));
    }

    #[test]
    fn test_disk_check_levels() {
        let fake = Arc::new(FakeDiskSpace::default());
        let monitor = DiskMonitor::new(DiskSettings {
            output: Some(DiskQuota::new("/data/products", 50.0, 10.0)),
            scratch: None,
        })
        .with_source(fake.clone());
        let metrics = Arc::new(MetricsCollector::new());
        let probe = disk_space_probe(Arc::new(monitor), metrics.clone());

        let check = probe();
        assert_eq!(check.status, HealthStatus::Degraded);
        assert!(check.message.unwrap().contains("unreadable"));

        fake.set_gb("/data/products", 200);
        assert_eq!(probe().status, HealthStatus::Healthy);
        assert_eq!(metrics.snapshot().output_disk_free_gb, Some(200.0));

        fake.set_gb("/data/products", 30);
        assert_eq!(probe().status, HealthStatus::Degraded);

        fake.set_gb("/data/products", 3);
        let check = probe();
        assert_eq!(check.status, HealthStatus::Unhealthy);
        assert_eq!(check.details["output"]["level"], json!("critical"));
    }
}
