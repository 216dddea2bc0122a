//! Streaming ingestion: the subband queue and the tasks around it.
//!
//! This module provides:
//! - File naming and group-id normalisation
//! - The SQLite-backed [`SubbandQueue`] state machine
//! - The directory [`StreamingWatcher`]
//! - [`StreamingWorker`]s that claim groups and run the pipeline
//! - A [`MaintenanceTask`] for flushing, stale detection and retention

mod clock;
mod maintenance;
mod naming;
mod queue;
mod schema;
mod watcher;
mod worker;


pub use clock::{Clock, ManualClock, SystemClock};
pub use maintenance::{refresh_queue_gauges, MaintenanceConfig, MaintenanceReport, MaintenanceTask};
pub use naming::{normalize_group_id, parse_group_timestamp, parse_subband_path, subband_file_name, SubbandName, GROUP_ID_FORMAT};
pub use queue::{Group, GroupState, QueueSettings, SubbandQueue, SubbandRecord};
pub use schema::SCHEMA_VERSION;
pub use watcher::{ScanReport, StreamingWatcher, WatcherConfig};
pub use worker::{group_fingerprint, validate_group_files, GroupOutcome, StreamingWorker, WorkerConfig, WorkerPool};
