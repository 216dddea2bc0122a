//! Pipeline building and execution.
//!
//! This module provides:
//! - Retry policies with exponential backoff and jitter
//! - Stage definitions and a registry for config-driven pipelines
//! - Dependency graph validation and topological ordering
//! - The sequential DAG orchestrator

mod builder;
mod dag;
mod orchestrator;
mod registry;
mod retry;
mod definition;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use dag::DependencyGraph;
pub use orchestrator::{PipelineOrchestrator, PipelineResult, StageResult, DEFAULT_CLEANUP_TIMEOUT};
pub(crate) use orchestrator::panic_message;
pub use registry::{StageConfig, StageRegistry};
pub use retry::{with_retry, RetryPolicy};
pub use definition::StageDefinition;
