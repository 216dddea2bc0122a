//! Structured cancellation and cleanup utilities.
//!
//! This module provides:
//! - CancellationToken for cooperative cancellation
//! - Bounded cleanup helpers used by the orchestrator
//! - StructuredTaskGroup for managing background tasks

mod cleanup;
mod task_group;
mod token;

pub use cleanup::{run_bounded_cleanup, CleanupOutcome};
pub use task_group::StructuredTaskGroup;
pub use token::CancellationToken;
