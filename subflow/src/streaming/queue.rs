//! SQLite-backed subband queue.
//!
//! The queue is the only shared mutable state in the system. Every mutation
//! runs in an `IMMEDIATE` transaction, so the conditional updates that move a
//! group between states are atomic across handles and processes.
//!
//! ```text
//! collecting ──(all subbands | flush)──▶ pending ──claim──▶ processing ──▶ complete
//!                                           ▲                  │    │
//!                                           │ requeue    lease │    └────▶ failed
//!                                           │            expiry▼
//!                                         failed          stale ──claim──▶ processing
//! ```

use super::clock::{Clock, SystemClock};
use super::naming::{normalize_group_id, parse_group_timestamp};
use super::schema;
use crate::errors::{ConfigurationError, QueueError, QueueResult};
use crate::utils::duration::secs;
use crate::utils::{from_unix_seconds, to_unix_seconds};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle state of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    /// Subbands are still arriving.
    Collecting,
    /// Ready to be claimed.
    Pending,
    /// Claimed by a worker under a lease.
    Processing,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Failed,
    /// The processing lease expired; claimable again.
    Stale,
}

impl GroupState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Collecting,
        Self::Pending,
        Self::Processing,
        Self::Complete,
        Self::Failed,
        Self::Stale,
    ];

    /// Returns the persisted name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Stale => "stale",
        }
    }

    /// Returns true for `complete` and `failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Returns true if a worker may claim a group in this state.
    #[must_use]
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Pending | Self::Stale)
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| QueueError::Database(format!("unknown group state '{s}'")))
    }
}

/// Queue behaviour settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Subbands that make a complete group.
    pub expected_subbands: u32,
    /// Nominal observation length of one group.
    #[serde(with = "secs")]
    pub chunk_duration: Duration,
    /// Extra time after `chunk_duration` before an incomplete group is flushed.
    #[serde(with = "secs")]
    pub flush_grace: Duration,
    /// Arrivals within this distance of an open group's timestamp join that group.
    #[serde(with = "secs")]
    pub cluster_tolerance: Duration,
    /// How long a writer waits on a locked database before giving up.
    #[serde(with = "secs")]
    pub busy_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            expected_subbands: 16,
            chunk_duration: Duration::from_secs(300),
            flush_grace: Duration::from_secs(60),
            cluster_tolerance: Duration::from_secs(60),
            busy_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueSettings {
    /// Sets the expected subband count.
    #[must_use]
    pub fn with_expected_subbands(mut self, n: u32) -> Self {
        self.expected_subbands = n;
        self
    }

    /// Sets the chunk duration.
    #[must_use]
    pub fn with_chunk_duration(mut self, d: Duration) -> Self {
        self.chunk_duration = d;
        self
    }

    /// Sets the flush grace period.
    #[must_use]
    pub fn with_flush_grace(mut self, d: Duration) -> Self {
        self.flush_grace = d;
        self
    }

    /// Sets the clustering tolerance. Zero disables clustering.
    #[must_use]
    pub fn with_cluster_tolerance(mut self, d: Duration) -> Self {
        self.cluster_tolerance = d;
        self
    }

    /// Checks the settings.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(1..=100).contains(&self.expected_subbands) {
            return Err(ConfigurationError::invalid(
                "queue.expected_subbands",
                format!("must be within 1..=100, got {}", self.expected_subbands),
            ));
        }
        if self.chunk_duration.is_zero() {
            return Err(ConfigurationError::invalid(
                "queue.chunk_duration",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// A group and its arrived files.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Group {
    /// Canonical timestamp id.
    pub group_id: String,
    /// Current state.
    pub state: GroupState,
    /// Subbands that make a complete group.
    pub expected_subbands: u32,
    /// Arrived subbands by index.
    pub arrived: BTreeMap<u32, PathBuf>,
    /// True if the group was flushed short of subbands.
    pub partial: bool,
    /// Nominal observation length.
    #[serde(with = "secs")]
    pub chunk_duration: Duration,
    /// First arrival.
    pub received_at: DateTime<Utc>,
    /// Last mutation.
    pub last_update: DateTime<Utc>,
    /// Worker holding (or last holding) the lease.
    pub lease_owner: Option<String>,
    /// When the current lease ends.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Times the group was requeued after failing.
    pub retry_count: u32,
    /// Times the group was claimed.
    pub claim_count: u32,
    /// Last recorded error.
    pub error: Option<String>,
}

impl Group {
    /// Number of arrived subbands.
    #[must_use]
    pub fn subband_count(&self) -> usize {
        self.arrived.len()
    }

    /// Returns true if every expected subband has arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.arrived.len() >= self.expected_subbands as usize
    }

    /// Indices that have not arrived.
    #[must_use]
    pub fn missing_subbands(&self) -> Vec<u32> {
        (0..self.expected_subbands)
            .filter(|i| !self.arrived.contains_key(i))
            .collect()
    }

    /// Arrived file paths in subband order.
    #[must_use]
    pub fn files(&self) -> Vec<PathBuf> {
        self.arrived.values().cloned().collect()
    }
}

/// The result of recording one subband.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubbandRecord {
    /// The group the subband was filed under, after normalisation and clustering.
    pub group_id: String,
    /// The subband index.
    pub index: u32,
    /// The recorded path. For duplicates, the path recorded first.
    pub path: PathBuf,
    /// False if this `(group, index)` was already known.
    pub newly_recorded: bool,
    /// Group state after the call.
    pub state: GroupState,
    /// Subbands arrived for the group after the call.
    pub arrived: usize,
}

/// Durable state machine grouping subband files into work units.
///
/// Cloning yields another handle on the same connection.
#[derive(Clone)]
pub struct SubbandQueue {
    conn: Arc<Mutex<Connection>>,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for SubbandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubbandQueue")
            .field("settings", &self.settings)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

type GroupRow = (
    String,
    String,
    f64,
    f64,
    u32,
    f64,
    bool,
    u32,
    u32,
    Option<String>,
    Option<f64>,
    Option<String>,
);

const GROUP_COLUMNS: &str = "group_id, state, received_at, last_update, expected_subbands, \
     chunk_duration, partial, retry_count, claim_count, lease_owner, lease_expires_at, error";

impl SubbandQueue {
    /// Opens or creates a queue database at `path`.
    pub fn open(path: impl AsRef<Path>, settings: QueueSettings) -> QueueResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(settings.busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::from_connection(conn, settings)
    }

    /// Opens a private in-memory queue.
    pub fn open_in_memory(settings: QueueSettings) -> QueueResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, settings)
    }

    fn from_connection(conn: Connection, settings: QueueSettings) -> QueueResult<Self> {
        settings
            .validate()
            .map_err(|e| QueueError::Database(e.to_string()))?;
        conn.busy_timeout(settings.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            settings,
            clock: Arc::new(SystemClock),
        })
    }

    fn init_schema(conn: &Connection) -> QueueResult<()> {
        for sql in schema::all_schemas() {
            conn.execute_batch(sql)?;
        }

        let current: Option<i32> = conn
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| row.get(0))
            .optional()?;

        match current {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)",
                    params![schema::SCHEMA_VERSION, Utc::now().to_rfc3339()],
                )?;
                info!(version = schema::SCHEMA_VERSION, "Initialized queue schema");
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(QueueError::Database(format!(
                    "queue schema version {v} is newer than supported {}",
                    schema::SCHEMA_VERSION
                )));
            }
            Some(v) if v < schema::SCHEMA_VERSION => {
                conn.execute(
                    "UPDATE schema_version SET version = ?1, updated_at = ?2 WHERE id = 1",
                    params![schema::SCHEMA_VERSION, Utc::now().to_rfc3339()],
                )?;
                info!(from = v, to = schema::SCHEMA_VERSION, "Upgraded queue schema");
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the settings.
    #[must_use]
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Returns the current time according to the queue's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn now_secs(&self) -> f64 {
        to_unix_seconds(self.clock.now())
    }

    /// Records the arrival of one subband file.
    ///
    /// Idempotent per path and per `(group, index)`: a path already filed
    /// (possibly under a clustered group) or a second file for a known
    /// `(group, index)` returns the existing record with
    /// `newly_recorded == false`. When the arrival count reaches
    /// `expected_subbands` the group moves `collecting → pending`.
    ///
    /// # Errors
    ///
    /// [`QueueError::GroupFinalized`] for late data on a terminal group,
    /// [`QueueError::InvalidSubband`] for an out-of-range index, and
    /// [`QueueError::MalformedGroupId`] for an unparseable id.
    pub fn record_subband(&self, group_id: &str, index: u32, path: &Path) -> QueueResult<SubbandRecord> {
        let normalized = normalize_group_id(group_id)?;
        let expected = self.settings.expected_subbands;
        if index >= expected {
            return Err(QueueError::InvalidSubband {
                group_id: normalized,
                index,
                expected,
            });
        }

        let now = self.now_secs();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some((owner, owner_index)) = path_owner(&tx, path)? {
            let state = state_of(&tx, &owner)?.ok_or_else(|| QueueError::UnknownGroup(owner.clone()))?;
            if state.is_terminal() {
                return Err(QueueError::GroupFinalized {
                    group_id: owner,
                    state: state.to_string(),
                    subband: owner_index,
                });
            }
            let arrived = count_files(&tx, &owner)?;
            tx.commit()?;
            debug!(group_id = %owner, subband = owner_index, path = %path.display(), "Path already recorded");
            return Ok(SubbandRecord {
                group_id: owner,
                index: owner_index,
                path: path.to_path_buf(),
                newly_recorded: false,
                state,
                arrived,
            });
        }

        let target = if state_of(&tx, &normalized)?.is_some() {
            normalized
        } else {
            match self.find_cluster_group(&tx, &normalized)? {
                Some(existing) => {
                    debug!(subband = index, from = %normalized, into = %existing, "Clustering subband into existing group");
                    existing
                }
                None => normalized,
            }
        };

        match state_of(&tx, &target)? {
            Some(state) if state.is_terminal() => {
                return Err(QueueError::GroupFinalized {
                    group_id: target,
                    state: state.to_string(),
                    subband: index,
                });
            }
            Some(state) if !matches!(state, GroupState::Collecting | GroupState::Pending) => {
                warn!(group_id = %target, state = %state, subband = index, "Subband arrived for a group already being processed");
            }
            Some(_) => {}
            None => {
                tx.execute(
                    "INSERT INTO groups (group_id, state, received_at, last_update, expected_subbands, chunk_duration)
                     VALUES (?1, 'collecting', ?2, ?2, ?3, ?4)",
                    params![target, now, expected, self.settings.chunk_duration.as_secs_f64()],
                )?;
                debug!(group_id = %target, "Created group");
            }
        }

        let previous: Option<String> = tx
            .query_row(
                "SELECT path FROM subband_files WHERE group_id = ?1 AND subband_idx = ?2",
                params![target, index],
                |row| row.get(0),
            )
            .optional()?;

        let newly_recorded = previous.is_none();
        let recorded_path = match previous {
            Some(prev) => PathBuf::from(prev),
            None => {
                tx.execute(
                    "INSERT INTO subband_files (group_id, subband_idx, path, recorded_at) VALUES (?1, ?2, ?3, ?4)",
                    params![target, index, path.to_string_lossy(), now],
                )?;
                tx.execute(
                    "UPDATE groups SET last_update = ?1 WHERE group_id = ?2",
                    params![now, target],
                )?;
                path.to_path_buf()
            }
        };

        let arrived = count_files(&tx, &target)?;
        if newly_recorded && arrived >= expected as usize {
            let promoted = tx.execute(
                "UPDATE groups SET state = 'pending', partial = 0, last_update = ?1
                 WHERE group_id = ?2 AND state = 'collecting'",
                params![now, target],
            )?;
            tx.execute(
                "UPDATE groups SET partial = 0 WHERE group_id = ?1 AND state = 'pending'",
                params![target],
            )?;
            if promoted == 1 {
                info!(group_id = %target, subbands = arrived, "Group complete, pending");
            }
        }

        let state = state_of(&tx, &target)?.ok_or_else(|| QueueError::UnknownGroup(target.clone()))?;
        tx.commit()?;

        Ok(SubbandRecord {
            group_id: target,
            index,
            path: recorded_path,
            newly_recorded,
            state,
            arrived,
        })
    }

    fn find_cluster_group(&self, tx: &Transaction<'_>, group_id: &str) -> QueueResult<Option<String>> {
        let tolerance = self.settings.cluster_tolerance.as_secs_f64();
        if tolerance <= 0.0 {
            return Ok(None);
        }
        let Some(incoming) = parse_group_timestamp(group_id) else {
            return Ok(None);
        };

        let mut stmt = tx.prepare(
            "SELECT group_id FROM groups WHERE state IN ('collecting', 'pending')
             ORDER BY received_at DESC LIMIT 100",
        )?;
        let candidates = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        #[allow(clippy::cast_precision_loss)]
        let best = candidates
            .into_iter()
            .filter_map(|gid| {
                let ts = parse_group_timestamp(&gid)?;
                let delta = (incoming - ts).num_milliseconds().unsigned_abs() as f64 / 1000.0;
                (delta <= tolerance).then_some((delta, gid))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, gid)| gid);
        Ok(best)
    }

    /// Moves collecting groups older than `chunk_duration + flush_grace` to
    /// `pending`, flagged partial. Returns the flushed ids.
    pub fn flush_expired(&self) -> QueueResult<Vec<String>> {
        let now = self.now_secs();
        let grace = self.settings.flush_grace.as_secs_f64();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let expired: Vec<(String, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT g.group_id, g.expected_subbands FROM groups g
                 WHERE g.state = 'collecting' AND g.received_at + g.chunk_duration + ?2 < ?1
                 ORDER BY g.group_id",
            )?;
            let rows = stmt
                .query_map(params![now, grace], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut flushed = Vec::with_capacity(expired.len());
        for (group_id, expected) in expired {
            let arrived = count_files(&tx, &group_id)?;
            let partial = arrived < expected as usize;
            tx.execute(
                "UPDATE groups SET state = 'pending', partial = ?1, last_update = ?2
                 WHERE group_id = ?3 AND state = 'collecting'",
                params![partial, now, group_id],
            )?;
            warn!(group_id = %group_id, arrived, expected, "Flushed incomplete group");
            flushed.push(group_id);
        }
        tx.commit()?;
        Ok(flushed)
    }

    /// Atomically claims a `pending` or `stale` group.
    ///
    /// Returns `false` if another worker holds it or it is not claimable.
    /// Expired leases are reclassified `stale` first.
    pub fn claim(&self, group_id: &str, worker_id: &str, lease: Duration) -> QueueResult<bool> {
        let group_id = normalize_group_id(group_id)?;
        let now = self.now_secs();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        mark_stale_in(&tx, now)?;
        let claimed = claim_in(&tx, &group_id, worker_id, now, lease)?;
        tx.commit()?;
        if claimed {
            debug!(group_id = %group_id, worker_id, "Claimed group");
        }
        Ok(claimed)
    }

    /// Claims the oldest claimable group, if any.
    pub fn claim_next(&self, worker_id: &str, lease: Duration) -> QueueResult<Option<Group>> {
        let now = self.now_secs();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        mark_stale_in(&tx, now)?;

        let next: Option<String> = tx
            .query_row(
                "SELECT group_id FROM groups WHERE state IN ('pending', 'stale')
                 ORDER BY group_id ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(group_id) = next else {
            tx.commit()?;
            return Ok(None);
        };

        if !claim_in(&tx, &group_id, worker_id, now, lease)? {
            tx.commit()?;
            return Ok(None);
        }
        let group = load_group(&tx, &group_id)?;
        tx.commit()?;
        debug!(group_id = %group_id, worker_id, "Claimed next group");
        Ok(group)
    }

    /// Reclassifies processing groups with expired leases as `stale`.
    pub fn mark_stale(&self) -> QueueResult<Vec<String>> {
        let now = self.now_secs();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stale = mark_stale_in(&tx, now)?;
        tx.commit()?;
        Ok(stale)
    }

    /// Extends the lease if `worker_id` still owns the group.
    pub fn renew_lease(&self, group_id: &str, worker_id: &str, lease: Duration) -> QueueResult<bool> {
        let now = self.now_secs();
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE groups SET lease_expires_at = ?1, last_update = ?2
             WHERE group_id = ?3 AND lease_owner = ?4 AND state = 'processing'",
            params![now + lease.as_secs_f64(), now, group_id, worker_id],
        )?;
        Ok(updated == 1)
    }

    /// Hands a processing group back to `pending` if `worker_id` owns it.
    ///
    /// Used on shutdown so another worker can pick the group up without
    /// waiting for the lease to expire.
    pub fn release(&self, group_id: &str, worker_id: &str) -> QueueResult<bool> {
        let now = self.now_secs();
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE groups SET state = 'pending', lease_owner = NULL, lease_expires_at = NULL, last_update = ?1
             WHERE group_id = ?2 AND lease_owner = ?3 AND state = 'processing'",
            params![now, group_id, worker_id],
        )?;
        if updated == 1 {
            info!(group_id, worker_id, "Released group");
        }
        Ok(updated == 1)
    }

    /// Marks a processing group complete.
    pub fn complete(&self, group_id: &str) -> QueueResult<()> {
        self.finish(group_id, GroupState::Complete, None)
    }

    /// Marks a processing group failed, retaining `error`.
    pub fn fail(&self, group_id: &str, error: &str) -> QueueResult<()> {
        self.finish(group_id, GroupState::Failed, Some(error))
    }

    fn finish(&self, group_id: &str, to: GroupState, error: Option<&str>) -> QueueResult<()> {
        let now = self.now_secs();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let from = state_of(&tx, group_id)?.ok_or_else(|| QueueError::UnknownGroup(group_id.to_string()))?;
        if from != GroupState::Processing {
            return Err(QueueError::InvalidTransition {
                group_id: group_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        tx.execute(
            "UPDATE groups SET state = ?1, error = COALESCE(?2, error), lease_expires_at = NULL, last_update = ?3
             WHERE group_id = ?4",
            params![to.as_str(), error, now, group_id],
        )?;
        tx.commit()?;
        info!(group_id, state = %to, "Group finalized");
        Ok(())
    }

    /// Marks a group complete if `worker_id` still holds its lease.
    ///
    /// Returns `false`, writing nothing, when the group is no longer
    /// processing under `worker_id`.
    pub fn complete_owned(&self, group_id: &str, worker_id: &str) -> QueueResult<bool> {
        self.finish_owned(group_id, worker_id, GroupState::Complete, None)
    }

    /// Marks a group failed if `worker_id` still holds its lease.
    pub fn fail_owned(&self, group_id: &str, worker_id: &str, error: &str) -> QueueResult<bool> {
        self.finish_owned(group_id, worker_id, GroupState::Failed, Some(error))
    }

    fn finish_owned(
        &self,
        group_id: &str,
        worker_id: &str,
        to: GroupState,
        error: Option<&str>,
    ) -> QueueResult<bool> {
        let now = self.now_secs();
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE groups SET state = ?1, error = COALESCE(?2, error), lease_expires_at = NULL, last_update = ?3
             WHERE group_id = ?4 AND lease_owner = ?5 AND state = 'processing'",
            params![to.as_str(), error, now, group_id, worker_id],
        )?;
        if updated == 1 {
            info!(group_id, worker_id, state = %to, "Group finalized");
        } else {
            warn!(group_id, worker_id, state = %to, "Finalize refused; lease not held");
        }
        Ok(updated == 1)
    }

    /// Returns a failed group to `pending` and bumps its retry count.
    pub fn requeue(&self, group_id: &str) -> QueueResult<()> {
        let now = self.now_secs();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let from = state_of(&tx, group_id)?.ok_or_else(|| QueueError::UnknownGroup(group_id.to_string()))?;
        if from != GroupState::Failed {
            return Err(QueueError::InvalidTransition {
                group_id: group_id.to_string(),
                from: from.to_string(),
                to: GroupState::Pending.to_string(),
            });
        }
        tx.execute(
            "UPDATE groups SET state = 'pending', retry_count = retry_count + 1, lease_owner = NULL,
             lease_expires_at = NULL, last_update = ?1 WHERE group_id = ?2",
            params![now, group_id],
        )?;
        tx.commit()?;
        info!(group_id, "Requeued failed group");
        Ok(())
    }

    /// Counts groups per state; every state is present.
    pub fn count_by_state(&self) -> QueueResult<BTreeMap<GroupState, usize>> {
        let conn = self.conn();
        let mut counts: BTreeMap<GroupState, usize> = GroupState::ALL.into_iter().map(|s| (s, 0)).collect();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM groups GROUP BY state")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (state, count) in rows {
            counts.insert(state.parse()?, usize::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }

    /// Loads a group with its files.
    pub fn group(&self, group_id: &str) -> QueueResult<Option<Group>> {
        let conn = self.conn();
        load_group(&conn, group_id)
    }

    /// Returns a group's file paths in subband order.
    pub fn group_files(&self, group_id: &str) -> QueueResult<Vec<PathBuf>> {
        let conn = self.conn();
        Ok(load_files(&conn, group_id)?.into_values().collect())
    }

    /// Age of the oldest claimable group.
    pub fn oldest_pending_age(&self) -> QueueResult<Option<Duration>> {
        let now = self.now_secs();
        let conn = self.conn();
        let oldest: Option<f64> = conn.query_row(
            "SELECT MIN(last_update) FROM groups WHERE state IN ('pending', 'stale')",
            [],
            |row| row.get(0),
        )?;
        Ok(oldest.map(|t| Duration::from_secs_f64((now - t).max(0.0))))
    }

    /// Deletes terminal groups not updated within `retention`. Returns how many.
    pub fn purge_terminal(&self, retention: Duration) -> QueueResult<usize> {
        let cutoff = self.now_secs() - retention.as_secs_f64();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM subband_files WHERE group_id IN (
                SELECT group_id FROM groups WHERE state IN ('complete', 'failed') AND last_update < ?1)",
            params![cutoff],
        )?;
        let purged = tx.execute(
            "DELETE FROM groups WHERE state IN ('complete', 'failed') AND last_update < ?1",
            params![cutoff],
        )?;
        tx.commit()?;
        if purged > 0 {
            info!(purged, "Purged terminal groups");
        }
        Ok(purged)
    }
}

fn state_of(conn: &Connection, group_id: &str) -> QueueResult<Option<GroupState>> {
    let state: Option<String> = conn
        .query_row(
            "SELECT state FROM groups WHERE group_id = ?1",
            params![group_id],
            |row| row.get(0),
        )
        .optional()?;
    state.map(|s| s.parse()).transpose()
}

fn path_owner(conn: &Connection, path: &Path) -> QueueResult<Option<(String, u32)>> {
    Ok(conn
        .query_row(
            "SELECT group_id, subband_idx FROM subband_files WHERE path = ?1",
            params![path.to_string_lossy()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

fn count_files(conn: &Connection, group_id: &str) -> QueueResult<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM subband_files WHERE group_id = ?1",
        params![group_id],
        |row| row.get(0),
    )?;
    Ok(usize::try_from(n).unwrap_or(0))
}

fn mark_stale_in(conn: &Connection, now: f64) -> QueueResult<Vec<String>> {
    let stale: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT group_id FROM groups WHERE state = 'processing' AND lease_expires_at < ?1
             ORDER BY group_id",
        )?;
        let rows = stmt
            .query_map(params![now], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    if !stale.is_empty() {
        conn.execute(
            "UPDATE groups SET state = 'stale', last_update = ?1
             WHERE state = 'processing' AND lease_expires_at < ?1",
            params![now],
        )?;
        for group_id in &stale {
            warn!(group_id = %group_id, "Lease expired, group marked stale");
        }
    }
    Ok(stale)
}

fn claim_in(conn: &Connection, group_id: &str, worker_id: &str, now: f64, lease: Duration) -> QueueResult<bool> {
    let updated = conn.execute(
        "UPDATE groups SET state = 'processing', lease_owner = ?1, lease_expires_at = ?2,
         claim_count = claim_count + 1, last_update = ?3
         WHERE group_id = ?4 AND state IN ('pending', 'stale')",
        params![worker_id, now + lease.as_secs_f64(), now, group_id],
    )?;
    Ok(updated == 1)
}

fn load_files(conn: &Connection, group_id: &str) -> QueueResult<BTreeMap<u32, PathBuf>> {
    let mut stmt = conn.prepare(
        "SELECT subband_idx, path FROM subband_files WHERE group_id = ?1 ORDER BY subband_idx",
    )?;
    let rows = stmt
        .query_map(params![group_id], |row| {
            Ok((row.get::<_, u32>(0)?, PathBuf::from(row.get::<_, String>(1)?)))
        })?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}

fn load_group(conn: &Connection, group_id: &str) -> QueueResult<Option<Group>> {
    let row: Option<GroupRow> = conn
        .query_row(
            &format!("SELECT {GROUP_COLUMNS} FROM groups WHERE group_id = ?1"),
            params![group_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                ))
            },
        )
        .optional()?;

    let Some((
        group_id,
        state,
        received_at,
        last_update,
        expected_subbands,
        chunk_duration,
        partial,
        retry_count,
        claim_count,
        lease_owner,
        lease_expires_at,
        error,
    )) = row
    else {
        return Ok(None);
    };

    let arrived = load_files(conn, &group_id)?;
    Ok(Some(Group {
        state: state.parse()?,
        expected_subbands,
        arrived,
        partial,
        chunk_duration: Duration::from_secs_f64(chunk_duration.max(0.0)),
        received_at: from_unix_seconds(received_at),
        last_update: from_unix_seconds(last_update),
        lease_owner,
        lease_expires_at: lease_expires_at.map(from_unix_seconds),
        retry_count,
        claim_count,
        error,
        group_id,
    }))
}
