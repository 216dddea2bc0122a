//! Retry policy with exponential backoff and jitter.
//!
//! Retry decisions are made by inspecting a classified error value
//! ([`Classify`]), never by unwinding.

use crate::cancellation::CancellationToken;
use crate::errors::{Classify, ConfigurationError, ErrorKind};
use crate::utils::duration::secs;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

fn default_retryable_kinds() -> BTreeSet<ErrorKind> {
    [
        ErrorKind::Conversion,
        ErrorKind::Calibration,
        ErrorKind::Imaging,
        ErrorKind::Photometry,
        ErrorKind::Mosaic,
        ErrorKind::Resource,
        ErrorKind::Timeout,
        ErrorKind::Io,
        ErrorKind::Database,
    ]
    .into_iter()
    .collect()
}

/// Per-stage retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(with = "secs")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay, before jitter.
    #[serde(with = "secs")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub exponential_base: f64,
    /// Relative jitter; the delay is scaled by a factor in `[1 - j, 1 + j]`.
    pub jitter_factor: f64,
    /// Error kinds this policy will retry.
    pub retryable_kinds: BTreeSet<ErrorKind>,
    /// Whether the pipeline keeps going after this stage fails permanently.
    pub continue_on_failure: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter_factor: 0.1,
            retryable_kinds: default_retryable_kinds(),
            continue_on_failure: false,
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the exponential base.
    #[must_use]
    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    /// Sets the jitter factor.
    #[must_use]
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    /// Replaces the retryable kinds.
    #[must_use]
    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_kinds = kinds.into_iter().collect();
        self
    }

    /// Sets whether the pipeline continues after this stage fails.
    #[must_use]
    pub fn with_continue_on_failure(mut self, value: bool) -> Self {
        self.continue_on_failure = value;
        self
    }

    /// Checks the policy's numeric fields.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::invalid(
                "max_attempts",
                "must be at least 1",
            ));
        }
        if !self.exponential_base.is_finite() || self.exponential_base < 1.0 {
            return Err(ConfigurationError::invalid(
                "exponential_base",
                format!("must be >= 1.0, got {}", self.exponential_base),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigurationError::invalid(
                "jitter_factor",
                format!("must be within [0, 1], got {}", self.jitter_factor),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigurationError::invalid(
                "initial_delay",
                "must not exceed max_delay",
            ));
        }
        Ok(())
    }

    /// Returns true if another attempt should follow failed attempt `attempt`.
    ///
    /// `attempt` is 1-based: after the first failure pass 1.
    pub fn should_retry<E: Classify + ?Sized>(&self, error: &E, attempt: u32) -> bool {
        let kind = error.kind();
        attempt < self.max_attempts
            && error.is_retryable()
            && !kind.is_never_retryable()
            && self.retryable_kinds.contains(&kind)
    }

    /// The delay before the attempt following `attempt`, without jitter.
    ///
    /// Attempt 0 is treated as 1.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.max(1) - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// The delay before the attempt following `attempt`, with jitter applied.
    #[must_use]
    pub fn get_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor)
    }
}

/// Runs `operation` until it succeeds, the policy gives up, or `cancel` fires.
///
/// The closure receives the 1-based attempt number. Backoff sleeps return early
/// with the last error when the token is cancelled.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !policy.should_retry(&err, attempt) || cancel.is_cancelled() {
                    return Err(err);
                }
                let delay = policy.get_delay(attempt);
                tracing::debug!(
                    operation = op_name,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Retrying after error"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(err),
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{QueueError, StageError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn deterministic() -> RetryPolicy {
        RetryPolicy::new()
            .with_jitter(0.0)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert!(!policy.continue_on_failure);
        assert!(policy.retryable_kinds.contains(&ErrorKind::Timeout));
        assert!(!policy.retryable_kinds.contains(&ErrorKind::Validation));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_exponential_delays_capped() {
        let policy = deterministic();
        let delays: Vec<u64> = (1..=5).map(|a| policy.get_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10]);
    }

    #[test]
    fn test_attempt_zero_treated_as_one() {
        let policy = deterministic();
        assert_eq!(policy.get_delay(0), policy.get_delay(1));
    }

    #[test]
    fn test_huge_attempt_clamps_to_max() {
        let policy = deterministic();
        assert_eq!(policy.get_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_secs(4))
            .with_jitter(0.25);
        for _ in 0..200 {
            let d = policy.get_delay(1).as_secs_f64();
            assert!((3.0..=5.0).contains(&d), "delay {d} out of bounds");
        }
    }

    #[test]
    fn test_should_retry_respects_attempts_and_kind() {
        let policy = RetryPolicy::new();
        let transient = StageError::conversion("disk hiccup", true);
        assert!(policy.should_retry(&transient, 1));
        assert!(policy.should_retry(&transient, 2));
        assert!(!policy.should_retry(&transient, 3));

        let permanent = StageError::conversion("corrupt file", false);
        assert!(!policy.should_retry(&permanent, 1));

        let validation = StageError::validation("missing input");
        assert!(!policy.should_retry(&validation, 1));
    }

    #[test]
    fn test_kind_not_in_set_is_not_retried() {
        let policy = RetryPolicy::new().with_retryable_kinds([ErrorKind::Timeout]);
        assert!(!policy.should_retry(&StageError::imaging("oom", true), 1));
        assert!(policy.should_retry(&StageError::timeout("x", Duration::from_secs(1)), 1));
    }

    #[test]
    fn test_shutdown_never_retried_even_if_listed() {
        let policy = RetryPolicy::new().with_retryable_kinds([ErrorKind::Shutdown]);
        let mut err = StageError::shutdown("stop");
        err.retryable = true;
        assert!(!policy.should_retry(&err, 1));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(RetryPolicy::new().with_max_attempts(0).validate().is_err());
        assert!(RetryPolicy::new().with_jitter(1.5).validate().is_err());
        assert!(RetryPolicy::new().with_exponential_base(0.5).validate().is_err());
    }

    #[test]
    fn test_policy_from_json() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts": 5, "initial_delay": 0.5, "retryable_kinds": ["imaging"]}"#,
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.retryable_kinds.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_succeeds_after_busy() {
        let policy = deterministic();
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result: Result<&str, QueueError> = with_retry(&policy, "complete", &token, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(QueueError::Busy("database is locked".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_gives_up_on_permanent() {
        let policy = deterministic();
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result: Result<(), QueueError> = with_retry(&policy, "fail", &token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(QueueError::UnknownGroup("g".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_stops_on_cancel() {
        let policy = RetryPolicy::new()
            .with_jitter(0.0)
            .with_initial_delay(Duration::from_secs(30))
            .with_max_attempts(10);
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel("shutdown");
        });

        let calls = AtomicU32::new(0);
        let result: Result<(), QueueError> = with_retry(&policy, "complete", &token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(QueueError::Busy("locked".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
