use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::accessor::DEFAULT_GROUP_DIR;
use crate::cadence::{self, Cadence};
use crate::failure::Health;

/// What a caller names when addressing a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Filesystem name; optional when exactly one filesystem is configured.
    pub fs_name: Option<String>,
    /// Directory path, relative to the subvolume root when `subvol` is set.
    pub path: String,
    pub subvol: Option<String>,
    pub group: Option<String>,
}

impl Target {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            fs_name: None,
            path: path.into(),
            subvol: None,
            group: None,
        }
    }

    pub fn with_fs(mut self, fs_name: impl Into<String>) -> Self {
        self.fs_name = Some(fs_name.into());
        self
    }

    pub fn with_subvol(mut self, subvol: impl Into<String>) -> Self {
        self.subvol = Some(subvol.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(fs) = &self.fs_name {
            write!(f, "{fs}:")?;
        }
        write!(f, "{}", self.path)?;
        if let Some(sv) = &self.subvol {
            write!(f, " (subvol={sv}")?;
            if let Some(g) = &self.group {
                write!(f, ", group={g}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// A target after the accessor has resolved it to one directory on one filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedTarget {
    pub fs_name: String,
    /// Absolute path inside the filesystem, e.g. `/volumes/_nogroup/sv1/data`.
    pub path: String,
    /// Path as given by the caller (relative to the subvolume when scoped).
    pub rel_path: String,
    pub subvol: Option<String>,
    pub group: Option<String>,
}

impl ResolvedTarget {
    /// Whether two resolutions address the same path with the same scoping.
    /// A subvolume without a group and one in the default group are the same.
    pub fn same_scope(&self, subvol: Option<&str>, group: Option<&str>) -> bool {
        if self.subvol.as_deref() != subvol {
            return false;
        }
        match subvol {
            Some(_) => {
                self.group.as_deref().unwrap_or(DEFAULT_GROUP_DIR)
                    == group.unwrap_or(DEFAULT_GROUP_DIR)
            }
            None => self.group.as_deref() == group,
        }
    }
}

impl fmt::Display for ResolvedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fs_name, self.path)
    }
}

/// Persisted per-cadence state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub active: bool,
    /// Snapshots created by this cadence; never decremented.
    pub created_count: u64,
    /// Grid anchor source.
    pub start: DateTime<Utc>,
    /// Fire instant of the most recent successful create.
    pub last_fired_at: Option<DateTime<Utc>>,
    /// Most recent fire instant skipped on startup or reactivation.
    pub last_missed_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub first_failure_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduleState {
    /// The latest fire instant that no longer needs servicing.
    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        match (self.last_fired_at, self.last_missed_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// One cadence of one path, joined with its path row.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleRecord {
    pub id: i64,
    pub path_id: i64,
    pub target: ResolvedTarget,
    pub cadence: Cadence,
    /// Position among the path's cadences ordered by (period length, spec).
    pub slot: u32,
    pub state: ScheduleState,
}

impl ScheduleRecord {
    fn anchor(&self) -> i64 {
        cadence::anchor(self.state.start)
    }

    /// The fire instant to service at `now`, if any.
    ///
    /// Every grid instant up to `now` that has not been fired or skipped
    /// collapses into the latest one. A failed fire leaves the cursor where
    /// it was, so the same instant is retried on later ticks.
    pub fn due_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.state.active {
            return None;
        }
        let latest = cadence::latest_fire_at_or_before(
            self.anchor(),
            self.cadence.timeout_seconds(),
            now.timestamp(),
        )?;
        let latest = Utc.timestamp_opt(latest, 0).single()?;
        match self.state.cursor() {
            Some(cursor) if latest <= cursor => None,
            _ => Some(latest),
        }
    }

    /// Next fire instant after the cursor (may be in the past while failing).
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        let anchor = self.anchor();
        let cursor = self
            .state
            .cursor()
            .map(|c| c.timestamp())
            .unwrap_or(anchor);
        let next = cadence::next_fire_after(anchor, self.cadence.timeout_seconds(), cursor);
        Utc.timestamp_opt(next, 0).single()
    }

    /// Entry name for a fire instant. The slot offset keeps cadences that
    /// share a boundary from colliding.
    pub fn snapshot_name(&self, fire: DateTime<Utc>) -> String {
        cadence::canonical_snapshot_name(fire + chrono::Duration::seconds(self.slot as i64))
    }
}

/// Result of one create attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Created { fire_at: DateTime<Utc> },
    Failed { at: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize)]
pub struct ListedCadence {
    pub cadence: Cadence,
    pub start: DateTime<Utc>,
    pub active: bool,
}

/// Everything scheduled at one path.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleListing {
    pub fs_name: String,
    pub path: String,
    pub subvol: Option<String>,
    pub group: Option<String>,
    pub schedules: Vec<ListedCadence>,
    /// Retention rules keyed by period letter (`n`, `h`, ...).
    pub retention: BTreeMap<String, u32>,
    /// True while any cadence is active.
    pub active: bool,
}

/// Per-cadence status row.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    pub fs_name: String,
    pub path: String,
    pub subvol: Option<String>,
    pub group: Option<String>,
    pub cadence: Cadence,
    pub start: DateTime<Utc>,
    pub active: bool,
    pub created_count: u64,
    pub pruned_count: u64,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_pruned_at: Option<DateTime<Utc>>,
    pub last_missed_at: Option<DateTime<Utc>>,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub first_failure_at: Option<DateTime<Utc>>,
    pub retention: BTreeMap<String, u32>,
    pub health: Health,
}
