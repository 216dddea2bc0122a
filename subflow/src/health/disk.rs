//! Free disk space monitoring.
//!
//! Workers consult a [`DiskMonitor`] before claiming: while a monitored
//! volume is below its critical threshold no new group is started.

use super::MetricsCollector;
use crate::errors::{ConfigurationError, StageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::Disks;
use tracing::warn;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Free-space thresholds for one directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskQuota {
    /// A directory on the monitored volume.
    pub path: PathBuf,
    /// Below this many GB the volume is reported degraded.
    pub warning_gb: f64,
    /// Below this many GB no new group is claimed.
    pub critical_gb: f64,
}

impl DiskQuota {
    /// Creates a quota.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, warning_gb: f64, critical_gb: f64) -> Self {
        Self {
            path: path.into(),
            warning_gb,
            critical_gb,
        }
    }

    fn validate(&self, field: &str) -> Result<(), ConfigurationError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigurationError::invalid(field, "path must not be empty"));
        }
        if !(self.critical_gb >= 0.0 && self.warning_gb >= self.critical_gb) {
            return Err(ConfigurationError::invalid(
                field,
                format!(
                    "requires 0 <= critical_gb <= warning_gb, got {} and {}",
                    self.critical_gb, self.warning_gb
                ),
            ));
        }
        Ok(())
    }

    fn level(&self, free_gb: Option<f64>) -> DiskLevel {
        match free_gb {
            None => DiskLevel::Unknown,
            Some(free) if free < self.critical_gb => DiskLevel::Critical,
            Some(free) if free < self.warning_gb => DiskLevel::Warning,
            Some(_) => DiskLevel::Ok,
        }
    }
}

/// Monitored volumes. With neither set, monitoring is off.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSettings {
    /// Where pipeline products are written.
    pub output: Option<DiskQuota>,
    /// Where stages keep temporary files.
    pub scratch: Option<DiskQuota>,
}

impl DiskSettings {
    /// Returns true if any volume is monitored.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.output.is_some() || self.scratch.is_some()
    }

    /// Checks the thresholds.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let Some(quota) = &self.output {
            quota.validate("disk.output")?;
        }
        if let Some(quota) = &self.scratch {
            quota.validate("disk.scratch")?;
        }
        Ok(())
    }
}

/// Classification of one volume's free space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskLevel {
    /// Above the warning threshold.
    Ok,
    /// Between the critical and warning thresholds.
    Warning,
    /// Below the critical threshold.
    Critical,
    /// Free space could not be read.
    Unknown,
}

/// One volume's free space at check time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskReading {
    /// `output` or `scratch`.
    pub volume: &'static str,
    /// The monitored directory.
    pub path: PathBuf,
    /// Free space in GB, if readable.
    pub free_gb: Option<f64>,
    /// Classification against the quota.
    pub level: DiskLevel,
    /// The quota's critical threshold.
    pub critical_gb: f64,
}

/// Source of free-space figures.
pub trait DiskSpace: Send + Sync + fmt::Debug {
    /// Free bytes on the volume holding `path`, or `None` if unknown.
    fn free_bytes(&self, path: &Path) -> Option<u64>;
}

/// Reads free space from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDiskSpace;

impl DiskSpace for SystemDiskSpace {
    fn free_bytes(&self, path: &Path) -> Option<u64> {
        let target = existing_ancestor(path)?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(sysinfo::Disk::available_space)
    }
}

/// The monitored directory may not exist yet; its nearest existing ancestor
/// lives on the same volume.
fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    absolute.ancestors().find_map(|p| p.canonicalize().ok())
}

/// Checks monitored volumes against their quotas.
#[derive(Debug, Clone)]
pub struct DiskMonitor {
    settings: DiskSettings,
    source: Arc<dyn DiskSpace>,
}

impl DiskMonitor {
    /// Creates a monitor reading from the operating system.
    #[must_use]
    pub fn new(settings: DiskSettings) -> Self {
        Self {
            settings,
            source: Arc::new(SystemDiskSpace),
        }
    }

    /// Replaces the free-space source.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn DiskSpace>) -> Self {
        self.source = source;
        self
    }

    /// Returns the settings.
    #[must_use]
    pub fn settings(&self) -> &DiskSettings {
        &self.settings
    }

    /// Reads every monitored volume.
    pub fn check(&self) -> Vec<DiskReading> {
        [("output", &self.settings.output), ("scratch", &self.settings.scratch)]
            .into_iter()
            .filter_map(|(volume, quota)| quota.as_ref().map(|q| (volume, q)))
            .map(|(volume, quota)| {
                #[allow(clippy::cast_precision_loss)]
                let free_gb = self
                    .source
                    .free_bytes(&quota.path)
                    .map(|bytes| bytes as f64 / BYTES_PER_GB);
                if free_gb.is_none() {
                    warn!(volume, path = %quota.path.display(), "Free disk space unavailable");
                }
                DiskReading {
                    volume,
                    path: quota.path.clone(),
                    free_gb,
                    level: quota.level(free_gb),
                    critical_gb: quota.critical_gb,
                }
            })
            .collect()
    }

    /// Reads every monitored volume and updates the disk gauges.
    pub fn record(&self, metrics: &MetricsCollector) -> Vec<DiskReading> {
        let readings = self.check();
        let free = |volume: &str| {
            readings
                .iter()
                .find(|r| r.volume == volume)
                .and_then(|r| r.free_gb)
        };
        metrics.update_disk_space(free("output"), free("scratch"));
        readings
    }

    /// Fails with a resource error for the first critical volume.
    ///
    /// Unreadable volumes do not block work.
    pub fn ensure_capacity(readings: &[DiskReading]) -> Result<(), StageError> {
        match readings.iter().find(|r| r.level == DiskLevel::Critical) {
            Some(r) => Err(StageError::resource(
                format!("{} disk space (GB) at {}", r.volume, r.path.display()),
                r.critical_gb,
                r.free_gb.unwrap_or_default(),
            )),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::DiskSpace;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    /// Free space set by the test, per path.
    #[derive(Debug, Default)]
    pub struct FakeDiskSpace {
        free: Mutex<HashMap<PathBuf, u64>>,
    }

    impl FakeDiskSpace {
        pub fn set_gb(&self, path: impl Into<PathBuf>, gb: u64) {
            self.free.lock().insert(path.into(), gb * 1024 * 1024 * 1024);
        }
    }

    impl DiskSpace for FakeDiskSpace {
        fn free_bytes(&self, path: &Path) -> Option<u64> {
            self.free.lock().get(path).copied()
        }
    }
}
