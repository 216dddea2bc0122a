//! Run identity for tracking pipeline executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Identifies a pipeline run with its correlation IDs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    /// The unique ID for this pipeline run.
    pub run_id: Uuid,

    /// The group being processed, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    /// The worker that claimed the group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    /// When the run was created.
    pub created_at: DateTime<Utc>,
}

impl Default for RunIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl RunIdentity {
    /// Creates a new run identity with a generated run ID.
    #[must_use]
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            group_id: None,
            worker_id: None,
            created_at: Utc::now(),
        }
    }

    /// Sets the group ID.
    #[must_use]
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Sets the worker ID.
    #[must_use]
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Converts to a dictionary with string values (or null).
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, Option<String>> {
        let mut map = HashMap::new();
        map.insert("run_id".to_string(), Some(self.run_id.to_string()));
        map.insert("group_id".to_string(), self.group_id.clone());
        map.insert("worker_id".to_string(), self.worker_id.clone());
        map.insert("created_at".to_string(), Some(self.created_at.to_rfc3339()));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_identity_creation() {
        let a = RunIdentity::new();
        let b = RunIdentity::new();
        assert_ne!(a.run_id, b.run_id);
        assert!(a.group_id.is_none());
    }

    #[test]
    fn test_run_identity_to_dict() {
        let identity = RunIdentity::new()
            .with_group_id("2025-10-02T00:12:00")
            .with_worker_id("worker-1");
        let dict = identity.to_dict();
        assert_eq!(
            dict.get("group_id"),
            Some(&Some("2025-10-02T00:12:00".to_string()))
        );
        assert_eq!(dict.get("worker_id"), Some(&Some("worker-1".to_string())));
        assert!(dict.contains_key("run_id"));
    }
}
