//! Pluggable health checks.

use crate::pipeline::panic_message;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Status reported by a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Working normally.
    Healthy,
    /// Working, but something needs attention.
    Degraded,
    /// Not working.
    Unhealthy,
    /// Not enough information.
    Unknown,
}

impl HealthStatus {
    /// Returns the status as a string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of one health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Check name.
    pub name: String,
    /// Reported status.
    pub status: HealthStatus,
    /// Human-readable explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Structured details.
    #[serde(default)]
    pub details: Map<String, Value>,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
}

impl HealthCheck {
    /// Creates a check result with no message or details.
    #[must_use]
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            message: None,
            details: Map::new(),
            checked_at: Utc::now(),
        }
    }

    /// Creates a healthy result.
    #[must_use]
    pub fn healthy(name: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Healthy)
    }

    /// Creates a degraded result with a message.
    #[must_use]
    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Degraded).with_message(message)
    }

    /// Creates an unhealthy result with a message.
    #[must_use]
    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Unhealthy).with_message(message)
    }

    /// Sets the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Adds a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// A health probe.
///
/// Implemented for any `Fn() -> HealthCheck` closure.
pub trait HealthProbe: Send + Sync {
    /// Runs the probe.
    fn check(&self) -> HealthCheck;
}

impl<F> HealthProbe for F
where
    F: Fn() -> HealthCheck + Send + Sync,
{
    fn check(&self) -> HealthCheck {
        self()
    }
}

/// Registry of named health probes with cached results.
#[derive(Default)]
pub struct HealthChecker {
    checks: DashMap<String, Arc<dyn HealthProbe>>,
    last_results: DashMap<String, HealthCheck>,
}

impl fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthChecker")
            .field("checks", &self.check_names())
            .finish_non_exhaustive()
    }
}

impl HealthChecker {
    /// Creates an empty checker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a probe, replacing any probe with the same name.
    pub fn register_check(&self, name: impl Into<String>, probe: impl HealthProbe + 'static) {
        let name = name.into();
        debug!(check = %name, "Registered health check");
        self.checks.insert(name, Arc::new(probe));
    }

    /// Removes a probe and its cached result.
    pub fn unregister_check(&self, name: &str) {
        self.checks.remove(name);
        self.last_results.remove(name);
    }

    /// Names of registered probes, sorted.
    #[must_use]
    pub fn check_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.checks.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Runs one probe. Returns `None` if no probe has that name.
    ///
    /// A panicking probe is reported as unhealthy.
    pub fn run_check(&self, name: &str) -> Option<HealthCheck> {
        let probe = self.checks.get(name).map(|entry| Arc::clone(entry.value()))?;

        let mut result = match catch_unwind(AssertUnwindSafe(|| probe.check())) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(check = %name, panic = %message, "Health check panicked");
                HealthCheck::unhealthy(name, format!("check panicked: {message}"))
            }
        };
        name.clone_into(&mut result.name);

        self.last_results.insert(name.to_string(), result.clone());
        Some(result)
    }

    /// Runs every probe and aggregates the results.
    pub fn run_all(&self) -> AggregatedHealth {
        let checks = self
            .check_names()
            .into_iter()
            .filter_map(|name| self.run_check(&name).map(|result| (name, result)))
            .collect();
        AggregatedHealth {
            checks,
            checked_at: Utc::now(),
        }
    }

    /// Returns the cached result of the last run of `name`.
    #[must_use]
    pub fn last_result(&self, name: &str) -> Option<HealthCheck> {
        self.last_results.get(name).map(|r| r.value().clone())
    }
}

/// Results of all checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedHealth {
    /// Results by check name.
    pub checks: BTreeMap<String, HealthCheck>,
    /// When the checks ran.
    pub checked_at: DateTime<Utc>,
}

impl AggregatedHealth {
    /// Worst status across checks. `Unknown` when there are no checks.
    #[must_use]
    pub fn overall_status(&self) -> HealthStatus {
        if self.checks.is_empty() {
            return HealthStatus::Unknown;
        }
        let has = |status| self.checks.values().any(|c| c.status == status);
        if has(HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if has(HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else if has(HealthStatus::Unknown) {
            HealthStatus::Unknown
        } else {
            HealthStatus::Healthy
        }
    }

    /// True when every check is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.overall_status() == HealthStatus::Healthy
    }

    /// True when the system can take work (healthy or degraded).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(
            self.overall_status(),
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    /// Renders the aggregate as JSON.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let checks: Map<String, Value> = self
            .checks
            .iter()
            .map(|(name, check)| {
                (
                    name.clone(),
                    json!({
                        "status": check.status,
                        "message": check.message,
                        "details": check.details,
                    }),
                )
            })
            .collect();
        json!({
            "overall_status": self.overall_status(),
            "is_healthy": self.is_healthy(),
            "is_ready": self.is_ready(),
            "checked_at": self.checked_at.to_rfc3339(),
            "checks": checks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unknown_check_returns_none() {
        let checker = HealthChecker::new();
        assert!(checker.run_check("queue").is_none());
        assert!(checker.last_result("queue").is_none());
    }

    #[test]
    fn test_panicking_check_is_unhealthy() {
        let checker = HealthChecker::new();
        checker.register_check("disk", || -> HealthCheck { panic!("statvfs failed") });

        let result = checker.run_check("disk").unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.message.unwrap().contains("statvfs failed"));
        assert_eq!(checker.last_result("disk").unwrap().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_result_name_matches_registration() {
        let checker = HealthChecker::new();
        checker.register_check("queue", || HealthCheck::healthy("something else"));
        assert_eq!(checker.run_check("queue").unwrap().name, "queue");
    }

    #[test]
    fn test_overall_status_is_worst() {
        let checker = HealthChecker::new();
        checker.register_check("a", || HealthCheck::healthy("a"));
        checker.register_check("b", || HealthCheck::degraded("b", "backlog growing"));

        let health = checker.run_all();
        assert_eq!(health.overall_status(), HealthStatus::Degraded);
        assert!(!health.is_healthy());
        assert!(health.is_ready());

        checker.register_check("c", || HealthCheck::unhealthy("c", "worker dead"));
        let health = checker.run_all();
        assert_eq!(health.overall_status(), HealthStatus::Unhealthy);
        assert!(!health.is_ready());
    }

    #[test]
    fn test_empty_is_unknown() {
        let health = HealthChecker::new().run_all();
        assert_eq!(health.overall_status(), HealthStatus::Unknown);
        assert!(!health.is_ready());
    }

    #[test]
    fn test_unregister_drops_cached_result() {
        let checker = HealthChecker::new();
        checker.register_check("a", || HealthCheck::healthy("a"));
        checker.run_check("a");
        checker.unregister_check("a");
        assert!(checker.last_result("a").is_none());
        assert!(checker.check_names().is_empty());
    }

    #[test]
    fn test_to_json_shape() {
        let checker = HealthChecker::new();
        checker.register_check("queue", || {
            HealthCheck::healthy("queue").with_detail("pending", json!(3))
        });
        let json = checker.run_all().to_json();
        assert_eq!(json["overall_status"], "healthy");
        assert_eq!(json["is_ready"], true);
        assert_eq!(json["checks"]["queue"]["details"]["pending"], 3);
    }
}
