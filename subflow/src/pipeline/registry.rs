//! Stage registry and serialisable stage configuration.
//!
//! Pipelines described in configuration files name their stages by string. The
//! registry resolves those names to implementations once, at build time, so an
//! unknown name is a configuration error rather than a runtime dispatch miss.

use super::{RetryPolicy, StageDefinition};
use crate::errors::ConfigurationError;
use crate::stages::Stage;
use crate::utils::duration::secs_opt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Declarative description of one stage in a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Name of the stage within the pipeline.
    pub name: String,
    /// Registry key of the implementation; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
    /// Names of stages that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Retry policy for the stage.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-attempt timeout in seconds.
    #[serde(default, with = "secs_opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl StageConfig {
    /// Creates a config entry for `name` with default settings.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            implementation: None,
            dependencies: Vec::new(),
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| (*d).to_string()).collect();
        self
    }

    /// Returns the registry key to resolve.
    #[must_use]
    pub fn implementation_key(&self) -> &str {
        self.implementation.as_deref().unwrap_or(&self.name)
    }
}

/// Maps implementation names to stage instances.
#[derive(Debug, Default)]
pub struct StageRegistry {
    stages: RwLock<HashMap<String, Arc<dyn Stage>>>,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stage under its own name, replacing any previous entry.
    pub fn register(&self, stage: Arc<dyn Stage>) {
        let key = stage.name().to_string();
        self.register_as(key, stage);
    }

    /// Registers a stage under an explicit key.
    pub fn register_as(&self, key: impl Into<String>, stage: Arc<dyn Stage>) {
        let key = key.into();
        tracing::debug!(stage = %key, "Registered stage");
        self.stages.write().insert(key, stage);
    }

    /// Looks up a stage.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<dyn Stage>> {
        self.stages.read().get(key).cloned()
    }

    /// Returns true if the key is registered.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.stages.read().contains_key(key)
    }

    /// Lists registered keys in sorted order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.stages.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Resolves a list of stage configs into definitions, preserving order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::UnregisteredStage`] for unknown keys.
    pub fn resolve(&self, configs: &[StageConfig]) -> Result<Vec<StageDefinition>, ConfigurationError> {
        configs
            .iter()
            .map(|cfg| {
                let key = cfg.implementation_key();
                let stage = self
                    .get(key)
                    .ok_or_else(|| ConfigurationError::UnregisteredStage(key.to_string()))?;
                let mut def = StageDefinition::new(&cfg.name, stage)
                    .with_dependencies(cfg.dependencies.iter().cloned())
                    .with_retry_policy(cfg.retry.clone());
                def.timeout = cfg.timeout;
                Ok(def)
            })
            .collect()
    }
}
