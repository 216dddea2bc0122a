//! Core status types shared by the orchestrator and the queue.

mod status;

pub use status::{PipelineStatus, StageStatus};
