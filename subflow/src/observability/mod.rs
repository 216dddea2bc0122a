//! Logging initialisation.
//!
//! Library code only emits `tracing` events; processes embedding subflow call
//! [`init_tracing`] once at startup to install a subscriber.

use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::{fmt as layer_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Json => "json",
        })
    }
}

impl FromStr for LogFormat {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(ConfigurationError::invalid(
                "logging.format",
                format!("unknown format '{other}'"),
            )),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// Default filter directives, e.g. `info,subflow::streaming=debug`.
    /// `RUST_LOG` takes precedence when set.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Checks that the filter parses.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        EnvFilter::try_new(&self.filter)
            .map(|_| ())
            .map_err(|e| ConfigurationError::invalid("logging.filter", e.to_string()))
    }

    fn env_filter(&self) -> Result<EnvFilter, ConfigurationError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.filter)
                .map_err(|e| ConfigurationError::invalid("logging.filter", e.to_string())),
        }
    }
}

/// Installs the global subscriber.
///
/// Returns `Ok(false)` if a subscriber was already installed, which is left in
/// place.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool, ConfigurationError> {
    let filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Text => registry
            .with(layer_fmt::layer().with_target(true))
            .try_init()
            .is_ok(),
        LogFormat::Json => registry
            .with(layer_fmt::layer().json().with_target(true))
            .try_init()
            .is_ok(),
    };
    if installed {
        tracing::debug!(format = %config.format, filter = %config.filter, "Tracing initialised");
    }
    Ok(installed)
}
