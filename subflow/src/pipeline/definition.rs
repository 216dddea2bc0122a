//! Stage definitions.

use super::RetryPolicy;
use crate::errors::ConfigurationError;
use crate::stages::Stage;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// A stage together with its place in the DAG.
#[derive(Debug, Clone)]
pub struct StageDefinition {
    /// The unique name of the stage.
    pub name: String,
    /// The stage implementation.
    pub stage: Arc<dyn Stage>,
    /// Names of stages that must complete first.
    pub dependencies: BTreeSet<String>,
    /// How failures of this stage are retried.
    pub retry_policy: RetryPolicy,
    /// Time budget for each attempt.
    pub timeout: Option<Duration>,
}

impl StageDefinition {
    /// Creates a definition with no dependencies and the default retry policy.
    #[must_use]
    pub fn new(name: impl Into<String>, stage: Arc<dyn Stage>) -> Self {
        Self {
            name: name.into(),
            stage,
            dependencies: BTreeSet::new(),
            retry_policy: RetryPolicy::default(),
            timeout: None,
        }
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validates the definition in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage depends on itself, the name is blank,
    /// or the retry policy is malformed.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::invalid("name", "stage name cannot be empty"));
        }
        if self.dependencies.contains(&self.name) {
            return Err(ConfigurationError::SelfDependency(self.name.clone()));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigurationError::invalid(
                format!("{}.timeout", self.name),
                "must be greater than zero",
            ));
        }
        self.retry_policy.validate()
    }
}
