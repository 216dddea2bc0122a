//! Pipeline builder with validation.

use super::{PipelineOrchestrator, RetryPolicy, StageConfig, StageDefinition, StageRegistry};
use crate::errors::ConfigurationError;
use crate::events::EventSink;
use crate::stages::Stage;
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating validated orchestrators.
#[derive(Default)]
pub struct PipelineBuilder {
    name: String,
    definitions: Vec<StageDefinition>,
    default_retry: Option<RetryPolicy>,
    sink: Option<Arc<dyn EventSink>>,
    cleanup_timeout: Option<Duration>,
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("stages", &self.definitions.iter().map(|d| &d.name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a stage with the given dependencies.
    ///
    /// The stage gets the builder's default retry policy, if one was set.
    #[must_use]
    pub fn stage(mut self, name: impl Into<String>, stage: Arc<dyn Stage>, dependencies: &[&str]) -> Self {
        let mut def = StageDefinition::new(name, stage).with_dependencies(dependencies.iter().copied());
        if let Some(policy) = &self.default_retry {
            def.retry_policy = policy.clone();
        }
        self.definitions.push(def);
        self
    }

    /// Adds a fully specified stage definition.
    #[must_use]
    pub fn definition(mut self, def: StageDefinition) -> Self {
        self.definitions.push(def);
        self
    }

    /// Adds every stage described by `configs`, resolving implementations from `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if a config names an unregistered implementation.
    pub fn from_configs(
        mut self,
        registry: &StageRegistry,
        configs: &[StageConfig],
    ) -> Result<Self, ConfigurationError> {
        self.definitions.extend(registry.resolve(configs)?);
        Ok(self)
    }

    /// Sets the retry policy applied by subsequent [`stage`](Self::stage) calls.
    #[must_use]
    pub fn default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = Some(policy);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Sets the bound on each `cleanup` call.
    #[must_use]
    pub fn cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = Some(timeout);
        self
    }

    /// Returns the number of stages added so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.definitions.len()
    }

    /// Validates the graph and builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns the first structural problem found: duplicates, unknown or self
    /// dependencies, or a cycle.
    pub fn build(self) -> Result<PipelineOrchestrator, ConfigurationError> {
        let mut orchestrator = PipelineOrchestrator::new(self.definitions)?.with_name(self.name);
        if let Some(sink) = self.sink {
            orchestrator = orchestrator.with_event_sink(sink);
        }
        if let Some(timeout) = self.cleanup_timeout {
            orchestrator = orchestrator.with_cleanup_timeout(timeout);
        }
        Ok(orchestrator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::NoOpStage;

    #[test]
    fn test_builder_orders_stages() {
        let orchestrator = PipelineBuilder::new("continuum")
            .stage("imaging", Arc::new(NoOpStage::new("imaging")), &["calibration"])
            .stage("conversion", Arc::new(NoOpStage::new("conversion")), &[])
            .stage("calibration", Arc::new(NoOpStage::new("calibration")), &["conversion"])
            .build()
            .unwrap();

        assert_eq!(orchestrator.name(), "continuum");
        assert_eq!(
            orchestrator.execution_order(),
            &["conversion", "calibration", "imaging"]
        );
    }

    #[test]
    fn test_builder_reports_unknown_dependency() {
        let err = PipelineBuilder::new("broken")
            .stage("imaging", Arc::new(NoOpStage::new("imaging")), &["conversion"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownDependency { .. }));
    }

    #[test]
    fn test_default_retry_applies_to_later_stages() {
        let builder = PipelineBuilder::new("p")
            .stage("a", Arc::new(NoOpStage::new("a")), &[])
            .default_retry(RetryPolicy::none())
            .stage("b", Arc::new(NoOpStage::new("b")), &["a"]);

        assert_eq!(builder.stage_count(), 2);
        assert_eq!(builder.definitions[0].retry_policy.max_attempts, 3);
        assert_eq!(builder.definitions[1].retry_policy.max_attempts, 1);
    }

    #[test]
    fn test_from_configs() {
        let registry = StageRegistry::new();
        registry.register(Arc::new(NoOpStage::new("conversion")));
        registry.register(Arc::new(NoOpStage::new("imaging")));
        let configs = vec![
            StageConfig::new("conversion"),
            StageConfig::new("imaging").with_dependencies(&["conversion"]),
        ];

        let orchestrator = PipelineBuilder::new("cfg")
            .from_configs(&registry, &configs)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(orchestrator.execution_order().len(), 2);
    }
}
