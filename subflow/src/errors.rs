//! Error types for the subflow framework.
//!
//! Stage failures are plain data ([`StageError`]) so that retry decisions can be
//! made by inspecting a value instead of unwinding. Infrastructure failures live in
//! [`QueueError`] and construction-time problems in [`ConfigurationError`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The main error type for subflow operations.
#[derive(Debug, Error)]
pub enum SubflowError {
    /// The pipeline or service configuration is invalid.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// A stage failed.
    #[error("{0}")]
    Stage(#[from] StageError),

    /// A queue operation failed.
    #[error("{0}")]
    Queue(#[from] QueueError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Classification of a failure, used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A precondition or postcondition did not hold.
    Validation,
    /// Raw data conversion failed.
    Conversion,
    /// Calibration solve or apply failed.
    Calibration,
    /// Imaging failed.
    Imaging,
    /// Source photometry failed.
    Photometry,
    /// Mosaic assembly failed.
    Mosaic,
    /// A resource (disk, memory) was insufficient.
    Resource,
    /// A stage exceeded its time budget.
    Timeout,
    /// Cooperative shutdown was requested.
    Shutdown,
    /// The queue database was busy or locked.
    Database,
    /// The operation violated the queue state machine.
    QueueState,
    /// A filesystem operation failed.
    Io,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Conversion => "conversion",
            Self::Calibration => "calibration",
            Self::Imaging => "imaging",
            Self::Photometry => "photometry",
            Self::Mosaic => "mosaic",
            Self::Resource => "resource",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
            Self::Database => "database",
            Self::QueueState => "queue_state",
            Self::Io => "io",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl ErrorKind {
    /// Kinds that no policy may retry.
    #[must_use]
    pub fn is_never_retryable(self) -> bool {
        matches!(self, Self::Validation | Self::Shutdown)
    }
}

/// Anything a [`RetryPolicy`](crate::pipeline::RetryPolicy) can classify.
pub trait Classify {
    /// Returns the error kind.
    fn kind(&self) -> ErrorKind;

    /// Returns whether the error itself claims to be transient.
    fn is_retryable(&self) -> bool;
}

/// A classified stage failure.
///
/// Stages return this from `execute`; the orchestrator never inspects the
/// message, only the kind and the retryable flag.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct StageError {
    /// The failure class.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Whether retrying may succeed.
    pub retryable: bool,
    /// Structured details for operators.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,
}

impl StageError {
    /// Creates a new stage error.
    ///
    /// Validation and shutdown kinds are forced non-retryable.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: retryable && !kind.is_never_retryable(),
            details: HashMap::new(),
        }
    }

    /// A precondition or postcondition failure.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message, false)
    }

    /// A conversion failure.
    #[must_use]
    pub fn conversion(message: impl Into<String>, retryable: bool) -> Self {
        Self::new(ErrorKind::Conversion, message, retryable)
    }

    /// A calibration failure.
    #[must_use]
    pub fn calibration(message: impl Into<String>, retryable: bool) -> Self {
        Self::new(ErrorKind::Calibration, message, retryable)
    }

    /// An imaging failure.
    #[must_use]
    pub fn imaging(message: impl Into<String>, retryable: bool) -> Self {
        Self::new(ErrorKind::Imaging, message, retryable)
    }

    /// A photometry failure.
    #[must_use]
    pub fn photometry(message: impl Into<String>, retryable: bool) -> Self {
        Self::new(ErrorKind::Photometry, message, retryable)
    }

    /// A mosaic failure.
    #[must_use]
    pub fn mosaic(message: impl Into<String>, retryable: bool) -> Self {
        Self::new(ErrorKind::Mosaic, message, retryable)
    }

    /// An insufficient resource. Retryable, since space may be freed.
    #[must_use]
    pub fn resource(resource: impl Into<String>, required: f64, available: f64) -> Self {
        let resource = resource.into();
        Self::new(
            ErrorKind::Resource,
            format!("insufficient {resource}: required {required:.2}, available {available:.2}"),
            true,
        )
        .with_detail("resource", serde_json::json!(resource))
        .with_detail("required", serde_json::json!(required))
        .with_detail("available", serde_json::json!(available))
    }

    /// A stage exceeded its timeout.
    #[must_use]
    pub fn timeout(stage: &str, limit: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("stage '{stage}' exceeded timeout of {:.3}s", limit.as_secs_f64()),
            true,
        )
        .with_detail("timeout_seconds", serde_json::json!(limit.as_secs_f64()))
    }

    /// Cooperative shutdown was requested.
    #[must_use]
    pub fn shutdown(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Shutdown, reason, false)
    }

    /// An unclassified failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message, false)
    }

    /// Adds a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Returns true if this error is a shutdown signal.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.kind == ErrorKind::Shutdown
    }
}

impl Classify for StageError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        let retryable = matches!(
            err.kind(),
            std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::TimedOut
        );
        Self::new(ErrorKind::Io, err.to_string(), retryable)
    }
}

/// Errors raised while building a pipeline or validating settings.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The dependency graph contains a cycle.
    #[error("Cycle detected among stages: {}", .stages.join(", "))]
    CycleDetected {
        /// Stages that could not be ordered.
        stages: Vec<String>,
    },

    /// A stage depends on a stage that was never defined.
    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency {
        /// The dependent stage.
        stage: String,
        /// The missing dependency.
        dependency: String,
    },

    /// A stage depends on itself.
    #[error("Stage '{0}' cannot depend on itself")]
    SelfDependency(String),

    /// Two stages share a name.
    #[error("Stage '{0}' is defined more than once")]
    DuplicateStage(String),

    /// A stage name is not present in the registry.
    #[error("Stage '{0}' is not registered")]
    UnregisteredStage(String),

    /// The pipeline has no stages.
    #[error("Pipeline has no stages")]
    EmptyPipeline,

    /// A setting has an invalid value.
    #[error("Invalid setting '{field}': {reason}")]
    InvalidSetting {
        /// The offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ConfigurationError {
    /// Creates an invalid-setting error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the subband queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Data arrived for a group that is already terminal.
    #[error("Group '{group_id}' is already {state}; late subband {subband} rejected")]
    GroupFinalized {
        /// The group.
        group_id: String,
        /// Its terminal state.
        state: String,
        /// The rejected subband index.
        subband: u32,
    },

    /// The group does not exist.
    #[error("Unknown group '{0}'")]
    UnknownGroup(String),

    /// The requested transition is not allowed from the current state.
    #[error("Invalid transition for group '{group_id}': {from} -> {to}")]
    InvalidTransition {
        /// The group.
        group_id: String,
        /// The current state.
        from: String,
        /// The requested state.
        to: String,
    },

    /// The subband index is outside the expected range.
    #[error("Subband index {index} out of range for group '{group_id}' (expected < {expected})")]
    InvalidSubband {
        /// The group.
        group_id: String,
        /// The index.
        index: u32,
        /// Expected subband count.
        expected: u32,
    },

    /// The group id could not be parsed as a timestamp.
    #[error("Malformed group id '{0}'")]
    MalformedGroupId(String),

    /// The database is locked by another writer.
    #[error("Queue database busy: {0}")]
    Busy(String),

    /// Any other database failure.
    #[error("Queue database error: {0}")]
    Database(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for QueueError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                Self::Busy(err.to_string())
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

impl Classify for QueueError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Busy(_) | Self::Database(_) => ErrorKind::Database,
            Self::Io(_) => ErrorKind::Io,
            _ => ErrorKind::QueueState,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

/// Result alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;
