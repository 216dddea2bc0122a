//! Bounded cleanup helpers.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Outcome of a bounded cleanup call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The cleanup future finished in time.
    Completed,
    /// The cleanup future was abandoned after the timeout.
    TimedOut,
}

/// Runs a cleanup future with an upper bound on its duration.
///
/// Cleanup never propagates failure: a timeout is logged and reported.
pub async fn run_bounded_cleanup<F>(name: &str, limit: Duration, cleanup: F) -> CleanupOutcome
where
    F: Future<Output = ()>,
{
    match tokio::time::timeout(limit, cleanup).await {
        Ok(()) => CleanupOutcome::Completed,
        Err(_) => {
            warn!(
                stage = %name,
                timeout_ms = limit.as_millis() as u64,
                "Cleanup timed out"
            );
            CleanupOutcome::TimedOut
        }
    }
}
