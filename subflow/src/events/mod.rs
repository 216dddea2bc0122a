//! Pipeline event emission.
//!
//! The orchestrator reports lifecycle transitions to an [`EventSink`]. Sinks are
//! passed explicitly; there is no process-global sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names emitted by the orchestrator.
pub mod types {
    /// A pipeline run began.
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// A pipeline run finished, whatever its status.
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// A stage attempt began.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage attempt failed and will be retried.
    pub const STAGE_RETRYING: &str = "stage.retrying";
    /// A stage completed.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage failed permanently.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A stage was not run.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
    /// A stage was interrupted by cancellation.
    pub const STAGE_CANCELLED: &str = "stage.cancelled";
}
