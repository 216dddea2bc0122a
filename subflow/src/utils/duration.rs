//! Serde helpers that express durations as fractional seconds.
//!
//! Configuration files say `"lease_secs": 600` rather than
//! `{"secs": 600, "nanos": 0}`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

fn to_duration<E: serde::de::Error>(secs: f64) -> Result<Duration, E> {
    if secs.is_finite() && secs >= 0.0 {
        Ok(Duration::from_secs_f64(secs))
    } else {
        Err(E::custom(format!(
            "duration must be a non-negative number of seconds, got {secs}"
        )))
    }
}

/// `#[serde(with = "secs")]` for `Duration`.
pub mod secs {
    use super::{to_duration, Deserialize, Deserializer, Duration, Serializer};

    /// Serializes a duration as seconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    /// Deserializes seconds into a duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        to_duration(f64::deserialize(deserializer)?)
    }
}

/// `#[serde(with = "secs_opt")]` for `Option<Duration>`.
pub mod secs_opt {
    use super::{to_duration, Deserialize, Deserializer, Duration, Serializer};

    /// Serializes an optional duration as seconds or null.
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    /// Deserializes optional seconds into an optional duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(to_duration)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        #[serde(with = "super::secs")]
        lease: Duration,
        #[serde(default, with = "super::secs_opt")]
        timeout: Option<Duration>,
    }

    #[test]
    fn test_parse_seconds() {
        let s: Sample = serde_json::from_str(r#"{"lease": 1.5, "timeout": 30}"#).unwrap();
        assert_eq!(s.lease, Duration::from_millis(1500));
        assert_eq!(s.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_missing_optional() {
        let s: Sample = serde_json::from_str(r#"{"lease": 2}"#).unwrap();
        assert_eq!(s.timeout, None);
    }

    #[test]
    fn test_negative_rejected() {
        assert!(serde_json::from_str::<Sample>(r#"{"lease": -1}"#).is_err());
    }
}
