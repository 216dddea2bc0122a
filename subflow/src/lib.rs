//! # Subflow
//!
//! Streaming ingestion and pipeline orchestration for subband data.
//!
//! Subflow assembles instrument files arriving one subband at a time into
//! observation groups, and drives each complete (or flushed partial) group
//! through a DAG of processing stages:
//!
//! - **Durable queue**: a SQLite state machine (`collecting → pending →
//!   processing → complete | failed`, with lease-based stale reclaim)
//! - **Watcher and workers**: tokio tasks that feed and drain the queue
//! - **DAG orchestration**: dependency ordering, per-stage retry with
//!   exponential backoff, timeouts, cancellation and bounded cleanup
//! - **Health and metrics**: named probes, aggregated status and Prometheus text
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use subflow::prelude::*;
//!
//! let registry = StageRegistry::new();
//! registry.register(Arc::new(ConversionStage::new()));
//! registry.register(Arc::new(ImagingStage::new()));
//!
//! let config = StreamingConfig::from_json_file("streaming.json")?;
//! init_tracing(&config.logging)?;
//!
//! let service = StreamingService::new(config, &registry)?;
//! service.run_until(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod health;
pub mod observability;
pub mod pipeline;
pub mod service;
pub mod stages;
pub mod streaming;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationToken, StructuredTaskGroup};
    pub use crate::config::{HealthSettings, StreamingConfig};
    pub use crate::context::{PipelineContext, RunIdentity, ValueMap};
    pub use crate::core::{PipelineStatus, StageStatus};
    pub use crate::errors::{
        Classify, ConfigurationError, ErrorKind, QueueError, StageError, SubflowError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::health::{
        AggregatedHealth, DiskMonitor, DiskSettings, HealthCheck, HealthChecker, HealthStatus,
        MetricsCollector,
    };
    pub use crate::observability::{init_tracing, LogFormat, LoggingConfig};
    pub use crate::pipeline::{
        PipelineBuilder, PipelineOrchestrator, PipelineResult, RetryPolicy, StageConfig,
        StageDefinition, StageRegistry, StageResult,
    };
    pub use crate::service::StreamingService;
    pub use crate::stages::Stage;
    pub use crate::streaming::{
        Group, GroupState, QueueSettings, StreamingWatcher, StreamingWorker, SubbandQueue,
        WatcherConfig, WorkerConfig, WorkerPool,
    };
}
