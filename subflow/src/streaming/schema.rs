//! SQLite schema for the subband queue.

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Schema version bookkeeping.
pub const SCHEMA_VERSION_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// One row per group. Timestamps are Unix seconds.
pub const GROUPS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS groups (
    group_id TEXT PRIMARY KEY,
    state TEXT NOT NULL CHECK (state IN ('collecting', 'pending', 'processing', 'complete', 'failed', 'stale')),
    received_at REAL NOT NULL,
    last_update REAL NOT NULL,
    expected_subbands INTEGER NOT NULL,
    chunk_duration REAL NOT NULL,
    partial INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    claim_count INTEGER NOT NULL DEFAULT 0,
    lease_owner TEXT,
    lease_expires_at REAL,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_groups_state ON groups(state);
CREATE INDEX IF NOT EXISTS idx_groups_received ON groups(received_at);
";

/// One row per arrived subband. A path is filed under at most one group.
pub const SUBBAND_FILES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS subband_files (
    group_id TEXT NOT NULL REFERENCES groups(group_id) ON DELETE CASCADE,
    subband_idx INTEGER NOT NULL,
    path TEXT NOT NULL,
    recorded_at REAL NOT NULL,
    PRIMARY KEY (group_id, subband_idx)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_subband_files_path ON subband_files(path);
";

/// All schema statements in creation order.
pub fn all_schemas() -> [&'static str; 3] {
    [SCHEMA_VERSION_TABLE, GROUPS_TABLE, SUBBAND_FILES_TABLE]
}
