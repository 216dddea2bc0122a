//! Utility helpers for durations and timestamps.

pub mod duration;

use chrono::{DateTime, TimeZone, Utc};

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Converts a timestamp to fractional Unix seconds.
#[must_use]
pub fn to_unix_seconds(ts: Timestamp) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

/// Converts fractional Unix seconds back to a timestamp.
///
/// Out-of-range values clamp to the Unix epoch.
#[must_use]
pub fn from_unix_seconds(secs: f64) -> Timestamp {
    #[allow(clippy::cast_possible_truncation)]
    let micros = (secs * 1_000_000.0).round() as i64;
    Utc.timestamp_micros(micros)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_seconds_roundtrip_precision() {
        let ts = Utc.with_ymd_and_hms(2025, 10, 2, 0, 12, 0).unwrap();
        let secs = to_unix_seconds(ts);
        assert_eq!(from_unix_seconds(secs), ts);
        assert_eq!(from_unix_seconds(secs + 0.5).timestamp_subsec_millis(), 500);
    }
}
