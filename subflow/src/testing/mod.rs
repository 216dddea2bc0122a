//! Testing utilities for subflow pipelines.
//!
//! This module provides:
//! - Scripted, slow, failing and recording stages
//! - A manually advanced clock for queue timing tests
//! - An in-memory queue fixture

mod mocks;

pub use crate::streaming::ManualClock;
pub use mocks::{FailingStage, RecordingStage, ScriptedStage, SlowStage};

use crate::errors::QueueResult;
use crate::streaming::{QueueSettings, SubbandQueue};
use std::sync::Arc;

/// Opens an in-memory queue driven by a fresh [`ManualClock`].
pub fn memory_queue(settings: QueueSettings) -> QueueResult<(SubbandQueue, Arc<ManualClock>)> {
    let clock = Arc::new(ManualClock::default());
    let queue = SubbandQueue::open_in_memory(settings)?.with_clock(clock.clone());
    Ok((queue, clock))
}
