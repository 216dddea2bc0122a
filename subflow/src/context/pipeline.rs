//! The immutable data carrier threaded through stage execution.

use super::RunIdentity;
use crate::cancellation::CancellationToken;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A map of JSON values keyed by name.
pub type ValueMap = HashMap<String, Value>;

/// Context passed from stage to stage.
///
/// Every "mutation" returns a new context. The maps are shared behind `Arc`
/// and copied on write, so earlier contexts never observe later outputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineContext {
    identity: RunIdentity,
    config: Arc<ValueMap>,
    inputs: Arc<ValueMap>,
    outputs: Arc<ValueMap>,
    #[serde(skip)]
    cancellation: CancellationToken,
}

impl PipelineContext {
    /// Creates a context from static settings and run inputs.
    #[must_use]
    pub fn new(config: ValueMap, inputs: ValueMap) -> Self {
        Self {
            identity: RunIdentity::new(),
            config: Arc::new(config),
            inputs: Arc::new(inputs),
            outputs: Arc::new(HashMap::new()),
            cancellation: CancellationToken::new(),
        }
    }

    /// Returns a copy carrying `value` under `key` in its outputs.
    ///
    /// Last write wins per key.
    #[must_use]
    pub fn with_output(&self, key: impl Into<String>, value: Value) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.outputs).insert(key.into(), value);
        next
    }

    /// Returns a copy with several outputs added.
    #[must_use]
    pub fn with_outputs(&self, outputs: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.outputs).extend(outputs);
        next
    }

    /// Returns a copy with a different run identity.
    #[must_use]
    pub fn with_identity(&self, identity: RunIdentity) -> Self {
        let mut next = self.clone();
        next.identity = identity;
        next
    }

    /// Returns a copy bound to another cancellation token.
    #[must_use]
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        let mut next = self.clone();
        next.cancellation = token;
        next
    }

    /// Looks up an output.
    #[must_use]
    pub fn get_output(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }

    /// Looks up an input.
    #[must_use]
    pub fn get_input(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }

    /// Looks up a config value.
    #[must_use]
    pub fn get_config(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    /// Returns all outputs.
    #[must_use]
    pub fn outputs(&self) -> &ValueMap {
        &self.outputs
    }

    /// Returns all inputs.
    #[must_use]
    pub fn inputs(&self) -> &ValueMap {
        &self.inputs
    }

    /// Returns the static settings.
    #[must_use]
    pub fn config(&self) -> &ValueMap {
        &self.config
    }

    /// Returns the run identity.
    #[must_use]
    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    /// Returns the cancellation token stages should observe.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns true if the current stage has been asked to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
