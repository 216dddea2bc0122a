//! Context management for pipeline execution.
//!
//! This module provides:
//! - The immutable PipelineContext passed between stages
//! - RunIdentity correlation IDs

mod identity;
mod pipeline;

pub use identity::RunIdentity;
pub use pipeline::{PipelineContext, ValueMap};
