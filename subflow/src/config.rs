//! Service configuration.
//!
//! One JSON document describes the queue, watcher, workers, maintenance,
//! health thresholds, logging and the pipeline's stages. Every section has
//! defaults, so a minimal file only names the input directory and stages:
//!
//! ```json
//! {
//!   "watcher": { "input_dir": "/data/incoming" },
//!   "stages": [
//!     { "name": "conversion" },
//!     { "name": "calibration_solve", "dependencies": ["conversion"] }
//!   ]
//! }
//! ```

use crate::context::ValueMap;
use crate::errors::{ConfigurationError, SubflowError};
use crate::health::DiskSettings;
use crate::observability::LoggingConfig;
use crate::pipeline::StageConfig;
use crate::streaming::{MaintenanceConfig, QueueSettings, WatcherConfig, WorkerConfig};
use crate::utils::duration::secs;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Thresholds for the built-in health probes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Waiting groups above this mark the queue degraded.
    pub max_backlog: usize,
    /// A group waiting longer than this marks the queue unhealthy.
    #[serde(with = "secs")]
    pub max_wait: Duration,
    /// Workers silent for longer than this are reported unhealthy.
    #[serde(with = "secs")]
    pub max_worker_silence: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            max_backlog: 20,
            max_wait: Duration::from_secs(3600),
            max_worker_silence: Duration::from_secs(900),
        }
    }
}

/// Complete configuration of a streaming service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Path of the queue database.
    pub queue_db: PathBuf,
    /// Queue assembly settings.
    pub queue: QueueSettings,
    /// Directory watcher settings.
    pub watcher: WatcherConfig,
    /// Settings shared by every worker. Pool members get `<worker_id>-<n>`.
    pub worker: WorkerConfig,
    /// Number of concurrent workers.
    pub workers: usize,
    /// Queue housekeeping settings.
    pub maintenance: MaintenanceConfig,
    /// Health probe thresholds.
    pub health: HealthSettings,
    /// Free-space thresholds; workers stop claiming below a critical one.
    pub disk: DiskSettings,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Name used in pipeline logs and events.
    pub pipeline_name: String,
    /// Static values exposed to stages as context config.
    pub pipeline_config: ValueMap,
    /// Pipeline stages, resolved against a stage registry.
    pub stages: Vec<StageConfig>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            queue_db: PathBuf::from("state/streaming_queue.sqlite3"),
            queue: QueueSettings::default(),
            watcher: WatcherConfig::default(),
            worker: WorkerConfig::default(),
            workers: 1,
            maintenance: MaintenanceConfig::default(),
            health: HealthSettings::default(),
            disk: DiskSettings::default(),
            logging: LoggingConfig::default(),
            pipeline_name: "streaming".to_string(),
            pipeline_config: ValueMap::new(),
            stages: Vec::new(),
        }
    }
}

impl StreamingConfig {
    /// Parses a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, SubflowError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SubflowError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Serialises to pretty-printed JSON.
    pub fn to_json_pretty(&self) -> Result<String, SubflowError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks every section.
    ///
    /// Graph structure (cycles, unknown dependencies) is checked when the
    /// pipeline is built; here only names and numeric settings are checked.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.queue_db.as_os_str().is_empty() {
            return Err(ConfigurationError::invalid("queue_db", "must not be empty"));
        }
        self.queue.validate()?;
        self.worker.validate()?;
        self.logging.validate()?;
        self.disk.validate()?;

        if self.workers == 0 {
            return Err(ConfigurationError::invalid("workers", "must be at least 1"));
        }
        if self.watcher.scan_interval.is_zero() {
            return Err(ConfigurationError::invalid(
                "watcher.scan_interval",
                "must be greater than zero",
            ));
        }
        if self.maintenance.interval.is_zero() {
            return Err(ConfigurationError::invalid(
                "maintenance.interval",
                "must be greater than zero",
            ));
        }
        if self.health.max_worker_silence <= self.worker.poll_interval {
            return Err(ConfigurationError::invalid(
                "health.max_worker_silence",
                "must exceed worker.poll_interval",
            ));
        }

        if self.stages.is_empty() {
            return Err(ConfigurationError::EmptyPipeline);
        }
        let mut names = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(ConfigurationError::invalid("stages.name", "must not be blank"));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(ConfigurationError::DuplicateStage(stage.name.clone()));
            }
            stage.retry.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::LogFormat;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"{
        "watcher": { "input_dir": "/data/incoming" },
        "stages": [
            { "name": "conversion" },
            { "name": "calibration_solve", "dependencies": ["conversion"] }
        ]
    }"#;

    #[test]
    fn test_minimal_document_uses_defaults() {
        let config = StreamingConfig::from_json_str(MINIMAL).unwrap();

        assert_eq!(config.watcher.input_dir, PathBuf::from("/data/incoming"));
        assert_eq!(config.watcher.scan_interval, Duration::from_secs(5));
        assert_eq!(config.queue.expected_subbands, 16);
        assert_eq!(config.workers, 1);
        assert_eq!(config.stages.len(), 2);
        assert_eq!(config.stages[1].dependencies, vec!["conversion".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_durations_are_seconds() {
        let config = StreamingConfig::from_json_str(
            r#"{
                "queue": { "expected_subbands": 4, "chunk_duration": 120, "flush_grace": 30.5 },
                "worker": { "worker_id": "node1", "lease": 900 },
                "logging": { "format": "json", "filter": "debug" },
                "disk": { "output": { "path": "/data/products", "warning_gb": 50, "critical_gb": 10 } },
                "stages": [{ "name": "conversion", "timeout": 60 }]
            }"#,
        )
        .unwrap();

        assert_eq!(config.queue.chunk_duration, Duration::from_secs(120));
        assert_eq!(config.queue.flush_grace, Duration::from_millis(30_500));
        assert_eq!(config.worker.worker_id, "node1");
        assert_eq!(config.worker.lease, Duration::from_secs(900));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.stages[0].timeout, Some(Duration::from_secs(60)));
        let output = config.disk.output.unwrap();
        assert_eq!(output.path, PathBuf::from("/data/products"));
        assert!(config.disk.scratch.is_none());
    }

    #[test]
    fn test_validation_failures() {
        let base = StreamingConfig::from_json_str(MINIMAL).unwrap();

        let mut config = base.clone();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.stages.clear();
        assert_eq!(config.validate(), Err(ConfigurationError::EmptyPipeline));

        let mut config = base.clone();
        config.stages.push(StageConfig::new("conversion"));
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::DuplicateStage("conversion".to_string()))
        );

        let mut config = base.clone();
        config.queue.expected_subbands = 0;
        assert!(config.validate().is_err());

        let mut config = base;
        config.disk.scratch = Some(crate::health::DiskQuota::new("/scratch", 1.0, 5.0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streaming.json");
        let config = StreamingConfig::from_json_str(MINIMAL).unwrap();
        std::fs::write(&path, config.to_json_pretty().unwrap()).unwrap();

        let loaded = StreamingConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = StreamingConfig::from_json_file("/nonexistent/streaming.json").unwrap_err();
        assert!(matches!(err, SubflowError::Io(_)));
    }
}
