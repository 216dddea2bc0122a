//! Directory watcher that feeds arriving subband files into the queue.

use super::maintenance::refresh_queue_gauges;
use super::naming::parse_subband_path;
use super::queue::SubbandQueue;
use crate::cancellation::CancellationToken;
use crate::errors::{QueueError, QueueResult};
use crate::health::{ComponentStatus, MetricsCollector};
use crate::utils::duration::secs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Watcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Directory scanned for subband files.
    pub input_dir: PathBuf,
    /// Time between scans.
    #[serde(with = "secs")]
    pub scan_interval: Duration,
    /// Accepted extensions, without the dot. Empty accepts any.
    pub extensions: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("incoming"),
            scan_interval: Duration::from_secs(5),
            extensions: vec!["hdf5".to_string()],
        }
    }
}

impl WatcherConfig {
    /// Creates a config for `input_dir` with default settings.
    #[must_use]
    pub fn new(input_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            ..Self::default()
        }
    }

    /// Sets the scan interval.
    #[must_use]
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Sets the accepted extensions.
    #[must_use]
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    fn accepts(&self, extension: &str) -> bool {
        self.extensions.is_empty()
            || self
                .extensions
                .iter()
                .any(|e| e.eq_ignore_ascii_case(extension))
    }
}

/// Outcome of one directory scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Newly recorded subbands.
    pub recorded: usize,
    /// Files the queue already knew.
    pub duplicates: usize,
    /// Files whose names did not match or whose extension is not accepted.
    pub ignored: usize,
    /// Files the queue refused (late data, bad index).
    pub rejected: usize,
    /// Groups that became pending during this scan.
    pub completed_groups: Vec<String>,
}

/// Polls a directory and records subband files.
///
/// Files already handled by this watcher are skipped on later scans; after a
/// restart they are offered again and the queue reports them as duplicates.
#[derive(Debug)]
pub struct StreamingWatcher {
    queue: SubbandQueue,
    config: WatcherConfig,
    metrics: Option<Arc<MetricsCollector>>,
    seen: Mutex<HashSet<PathBuf>>,
}

impl StreamingWatcher {
    /// Creates a watcher.
    #[must_use]
    pub fn new(queue: SubbandQueue, config: WatcherConfig) -> Self {
        Self {
            queue,
            config,
            metrics: None,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Reports scan results and status to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the settings.
    #[must_use]
    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Scans the input directory once.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be read or the queue database fails.
    /// Per-file rejections are counted, not returned.
    pub fn scan_once(&self) -> QueueResult<ScanReport> {
        let listing = list_files(&self.config.input_dir)?;
        let mut report = ScanReport::default();
        let mut seen = self.seen.lock();

        for path in &listing {
            if seen.contains(path) {
                continue;
            }
            self.offer(path, &mut report)?;
            seen.insert(path.clone());
        }

        // Forget files that left the directory.
        let present: HashSet<&PathBuf> = listing.iter().collect();
        seen.retain(|p| present.contains(p));
        drop(seen);

        if let Some(metrics) = &self.metrics {
            metrics.add_subbands_recorded(report.recorded);
            if report.recorded > 0 {
                refresh_queue_gauges(&self.queue, metrics);
            }
        }
        Ok(report)
    }

    fn offer(&self, path: &Path, report: &mut ScanReport) -> QueueResult<()> {
        let Some(name) = parse_subband_path(path) else {
            debug!(path = %path.display(), "Ignoring file with unrecognised name");
            report.ignored += 1;
            return Ok(());
        };
        if !self.config.accepts(&name.extension) {
            debug!(path = %path.display(), extension = %name.extension, "Ignoring file extension");
            report.ignored += 1;
            return Ok(());
        }

        match self.queue.record_subband(&name.group_id, name.index, path) {
            Ok(record) if record.newly_recorded => {
                report.recorded += 1;
                debug!(
                    group_id = %record.group_id,
                    subband = record.index,
                    arrived = record.arrived,
                    "Recorded subband"
                );
                if record.arrived == self.queue.settings().expected_subbands as usize {
                    report.completed_groups.push(record.group_id);
                }
                Ok(())
            }
            Ok(_) => {
                report.duplicates += 1;
                Ok(())
            }
            Err(
                e @ (QueueError::GroupFinalized { .. }
                | QueueError::InvalidSubband { .. }
                | QueueError::MalformedGroupId(_)),
            ) => {
                warn!(path = %path.display(), error = %e, "Rejected subband file");
                report.rejected += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Runs an initial full scan and logs a summary.
    pub fn bootstrap(&self) -> QueueResult<ScanReport> {
        let report = self.scan_once()?;
        info!(
            input_dir = %self.config.input_dir.display(),
            recorded = report.recorded,
            duplicates = report.duplicates,
            ignored = report.ignored,
            rejected = report.rejected,
            "Watcher bootstrap scan complete"
        );
        Ok(report)
    }

    /// Scans every `scan_interval` until `token` is cancelled.
    ///
    /// Scan failures are logged and retried on the next tick.
    pub async fn run(self, token: CancellationToken) -> Result<(), String> {
        self.set_status(ComponentStatus::Running);
        if let Err(e) = self.bootstrap() {
            self.report_error(&e);
        }

        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                reason = token.cancelled() => {
                    info!(reason = %reason, "Watcher stopping");
                    self.set_status(ComponentStatus::Stopped);
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match self.scan_once() {
                        Ok(report) if report.recorded > 0 || report.rejected > 0 => {
                            info!(
                                recorded = report.recorded,
                                rejected = report.rejected,
                                completed_groups = report.completed_groups.len(),
                                "Watcher scan"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => self.report_error(&e),
                    }
                }
            }
        }
    }

    fn set_status(&self, status: ComponentStatus) {
        if let Some(metrics) = &self.metrics {
            metrics.set_watcher_status(status);
        }
    }

    fn report_error(&self, e: &QueueError) {
        error!(input_dir = %self.config.input_dir.display(), error = %e, "Watcher scan failed");
        if let Some(metrics) = &self.metrics {
            metrics.record_error(format!("watcher: {e}"));
        }
    }
}

fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
