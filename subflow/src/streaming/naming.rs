//! Subband file naming and group-id normalisation.
//!
//! Files are named `<timestamp>_sb<NN>.<ext>`, e.g.
//! `2025-10-02T00:12:00_sb05.hdf5`. The timestamp is the group id.

use crate::errors::{QueueError, QueueResult};
use chrono::NaiveDateTime;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Canonical group-id format.
pub const GROUP_ID_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const SUBBAND_PATTERN: &str =
    r"^(?P<timestamp>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})_sb(?P<index>\d{2})\.(?P<ext>[A-Za-z0-9]+)$";

static PATTERN: OnceLock<Regex> = OnceLock::new();

#[allow(clippy::expect_used)]
fn pattern() -> &'static Regex {
    PATTERN.get_or_init(|| Regex::new(SUBBAND_PATTERN).expect("subband pattern is a valid regex"))
}

/// The parts of a subband file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubbandName {
    /// Normalised group id.
    pub group_id: String,
    /// Subband index.
    pub index: u32,
    /// File extension without the dot.
    pub extension: String,
}

/// Parses a subband file name. Returns `None` if the name does not match.
pub fn parse_subband_path(path: &Path) -> Option<SubbandName> {
    let name = path.file_name()?.to_str()?;
    let caps = pattern().captures(name)?;
    let group_id = normalize_group_id(&caps["timestamp"]).ok()?;
    let index = caps["index"].parse().ok()?;
    Some(SubbandName {
        group_id,
        index,
        extension: caps["ext"].to_string(),
    })
}

/// Formats a subband file name.
pub fn subband_file_name(group_id: &str, index: u32, extension: &str) -> String {
    format!("{group_id}_sb{index:02}.{extension}")
}

/// Parses a group id into a timestamp.
///
/// Accepts a `T` or space separator and fractional seconds.
pub fn parse_group_timestamp(group_id: &str) -> Option<NaiveDateTime> {
    let s = group_id.trim().replacen(' ', "T", 1);
    NaiveDateTime::parse_from_str(&s, GROUP_ID_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

/// Normalises a group id to `YYYY-MM-DDTHH:MM:SS`, truncating fractional seconds.
pub fn normalize_group_id(group_id: &str) -> QueueResult<String> {
    parse_group_timestamp(group_id)
        .map(|ts| ts.format(GROUP_ID_FORMAT).to_string())
        .ok_or_else(|| QueueError::MalformedGroupId(group_id.to_string()))
}
