use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::{
    cadence::Cadence,
    db::init_db,
    error::{Result, SchedulerError},
    failure::Health,
    retention::{RetentionPolicy, RetentionSpec},
    types::{
        FireOutcome, ListedCadence, ResolvedTarget, ScheduleListing, ScheduleRecord,
        ScheduleState, ScheduleStatus,
    },
};

/// Cadence rows joined with their path row. `slot` is the cadence's position
/// among the path's cadences by (period length, spec).
const RECORD_SELECT: &str = "
    SELECT m.id, m.schedule_id, s.fs_name, s.path, s.rel_path, s.subvol, s.group_name,
           m.cadence, m.slot, m.start, m.active, m.created_count, m.last_fired,
           m.last_missed, m.consecutive_failures, m.first_failure, m.created_at
    FROM (SELECT *,
                 ROW_NUMBER() OVER (PARTITION BY schedule_id
                                    ORDER BY period_secs, cadence) - 1 AS slot
          FROM schedules_meta) m
    JOIN schedules s ON s.id = m.schedule_id";

const PATH_SELECT: &str = "
    SELECT id, fs_name, path, rel_path, subvol, group_name, pruned_count, last_pruned
    FROM schedules";

/// A path that has retention rules and at least one active cadence.
#[derive(Debug, Clone)]
pub struct PruneTarget {
    pub path_id: i64,
    pub target: ResolvedTarget,
    pub policy: RetentionPolicy,
}

struct PathRow {
    id: i64,
    target: ResolvedTarget,
    pruned_count: u64,
    last_pruned: Option<DateTime<Utc>>,
}

/// Durable schedule, retention and state storage.
///
/// Every operation takes the connection lock for its whole duration and every
/// mutation runs in a single transaction, so callers on other tasks observe
/// either all of a change or none of it.
pub struct ScheduleStore {
    conn: Mutex<Connection>,
}

impl ScheduleStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open (or create) a database file. WAL plus a busy timeout lets the CLI
    /// and a running daemon share the file.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_schedule(
        &self,
        target: &ResolvedTarget,
        cadence: Cadence,
        start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ScheduleRecord> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let path_id = match find_path(&tx, target)? {
            Some(row) => {
                check_scope(&row, target)?;
                row.id
            }
            None => {
                tx.execute(
                    "INSERT INTO schedules (fs_name, path, rel_path, subvol, group_name, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        target.fs_name,
                        target.path,
                        target.rel_path,
                        target.subvol,
                        target.group,
                        ts(now)
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        let exists: bool = tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM schedules_meta WHERE schedule_id = ?1 AND cadence = ?2)",
            params![path_id, cadence.to_string()],
            |row| row.get(0),
        )?;
        if exists {
            return Err(SchedulerError::DuplicateSchedule {
                target: target.to_string(),
                cadence: cadence.to_string(),
            });
        }

        tx.execute(
            "INSERT INTO schedules_meta (schedule_id, cadence, period_secs, start, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                path_id,
                cadence.to_string(),
                cadence.timeout_seconds() as i64,
                ts(start),
                ts(now)
            ],
        )?;
        let id = tx.last_insert_rowid();
        let record = fetch_record(&tx, id)?.ok_or_else(|| SchedulerError::NotFound {
            target: format!("schedule #{id}"),
        })?;
        tx.commit()?;

        info!(path = %target, %cadence, start = %ts(start), "schedule added");
        Ok(record)
    }

    /// Remove one cadence, or every cadence when `cadence` is `None`.
    /// Removing the last cadence drops the path and its retention rules.
    pub fn remove_schedule(&self, target: &ResolvedTarget, cadence: Option<Cadence>) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let row = require_path(&tx, target)?;

        let removed = match cadence {
            Some(c) => tx.execute(
                "DELETE FROM schedules_meta WHERE schedule_id = ?1 AND cadence = ?2",
                params![row.id, c.to_string()],
            )?,
            None => tx.execute("DELETE FROM schedules_meta WHERE schedule_id = ?1", [row.id])?,
        };
        if removed == 0 {
            return Err(not_found(target, cadence));
        }

        let remaining: i64 = tx.query_row(
            "SELECT COUNT(*) FROM schedules_meta WHERE schedule_id = ?1",
            [row.id],
            |r| r.get(0),
        )?;
        if remaining == 0 {
            tx.execute("DELETE FROM schedules WHERE id = ?1", [row.id])?;
        }
        tx.commit()?;

        info!(path = %target, removed, "schedule removed");
        Ok(removed)
    }

    pub fn list_schedules(&self, target: &ResolvedTarget) -> Result<ScheduleListing> {
        let conn = self.conn();
        let row = require_path(&conn, target)?;

        let mut stmt = conn.prepare_cached(
            "SELECT cadence, start, active FROM schedules_meta
             WHERE schedule_id = ?1 ORDER BY period_secs, cadence",
        )?;
        let schedules = stmt
            .query_map([row.id], |r| {
                Ok(ListedCadence {
                    cadence: get_cadence(r, 0)?,
                    start: get_ts(r, 1)?,
                    active: r.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let retention = load_policy(&conn, row.id)?.to_map();

        Ok(ScheduleListing {
            fs_name: row.target.fs_name,
            path: row.target.path,
            subvol: row.target.subvol,
            group: row.target.group,
            active: schedules.iter().any(|s| s.active),
            schedules,
            retention,
        })
    }

    /// Apply a create outcome and return the updated state.
    pub fn record_fired(&self, id: i64, outcome: FireOutcome) -> Result<ScheduleState> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = match outcome {
            FireOutcome::Created { fire_at } => tx.execute(
                "UPDATE schedules_meta
                 SET created_count = created_count + 1, last_fired = ?2,
                     consecutive_failures = 0, first_failure = NULL
                 WHERE id = ?1",
                params![id, ts(fire_at)],
            )?,
            FireOutcome::Failed { at } => tx.execute(
                "UPDATE schedules_meta
                 SET consecutive_failures = consecutive_failures + 1,
                     first_failure = COALESCE(first_failure, ?2)
                 WHERE id = ?1",
                params![id, ts(at)],
            )?,
        };
        if changed == 0 {
            return Err(SchedulerError::NotFound {
                target: format!("schedule #{id}"),
            });
        }
        let record = fetch_record(&tx, id)?.ok_or_else(|| SchedulerError::NotFound {
            target: format!("schedule #{id}"),
        })?;
        tx.commit()?;
        Ok(record.state)
    }

    /// Activate or deactivate one or all cadences at a path.
    ///
    /// Reactivation clears the failure counters and marks the latest grid
    /// instant already past as missed, so nothing is backfilled.
    pub fn set_active(
        &self,
        target: &ResolvedTarget,
        cadence: Option<Cadence>,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let row = require_path(&tx, target)?;

        let records: Vec<ScheduleRecord> = query_records(
            &tx,
            &format!("{RECORD_SELECT} WHERE m.schedule_id = ?1 ORDER BY m.slot"),
            [row.id],
        )?
        .into_iter()
        .filter(|r| cadence.map_or(true, |c| r.cadence == c))
        .collect();
        if records.is_empty() {
            return Err(not_found(target, cadence));
        }

        for rec in &records {
            if active {
                if rec.state.active {
                    continue;
                }
                let mut reactivated = rec.clone();
                reactivated.state.active = true;
                let missed = reactivated.due_fire(now).map(ts);
                tx.execute(
                    "UPDATE schedules_meta
                     SET active = 1, consecutive_failures = 0, first_failure = NULL,
                         last_missed = COALESCE(?2, last_missed)
                     WHERE id = ?1",
                    params![rec.id, missed],
                )?;
            } else {
                tx.execute("UPDATE schedules_meta SET active = 0 WHERE id = ?1", [rec.id])?;
            }
        }
        tx.commit()?;

        info!(path = %target, active, count = records.len(), "schedule state changed");
        Ok(records.len())
    }

    /// Deactivate by id. Returns false when already inactive or gone.
    pub fn deactivate(&self, id: i64) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE schedules_meta SET active = 0 WHERE id = ?1 AND active = 1",
            [id],
        )?;
        Ok(changed > 0)
    }

    pub fn is_active(&self, id: i64) -> Result<bool> {
        let conn = self.conn();
        let active: Option<bool> = conn
            .query_row("SELECT active FROM schedules_meta WHERE id = ?1", [id], |r| r.get(0))
            .optional()?;
        Ok(active.unwrap_or(false))
    }

    pub fn mark_missed(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE schedules_meta SET last_missed = ?2 WHERE id = ?1",
            params![id, ts(at)],
        )?;
        Ok(())
    }

    pub fn add_retention(&self, target: &ResolvedTarget, spec: RetentionSpec) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let row = require_path(&tx, target)?;
        let period = spec.period.letter().to_string();

        let exists: bool = tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM retention WHERE schedule_id = ?1 AND period = ?2)",
            params![row.id, period],
            |r| r.get(0),
        )?;
        if exists {
            return Err(SchedulerError::DuplicateRetention {
                target: target.to_string(),
                period,
            });
        }
        tx.execute(
            "INSERT INTO retention (schedule_id, period, keep_count) VALUES (?1, ?2, ?3)",
            params![row.id, period, spec.count],
        )?;
        tx.commit()?;

        info!(path = %target, retention = %spec, "retention added");
        Ok(())
    }

    /// Remove a rule; both period and count must match.
    pub fn remove_retention(&self, target: &ResolvedTarget, spec: RetentionSpec) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let row = require_path(&tx, target)?;
        let removed = tx.execute(
            "DELETE FROM retention WHERE schedule_id = ?1 AND period = ?2 AND keep_count = ?3",
            params![row.id, spec.period.letter().to_string(), spec.count],
        )?;
        if removed == 0 {
            return Err(SchedulerError::NotFound {
                target: format!("{target} (retention {spec})"),
            });
        }
        tx.commit()?;

        info!(path = %target, retention = %spec, "retention removed");
        Ok(())
    }

    pub fn retention_policy(&self, target: &ResolvedTarget) -> Result<RetentionPolicy> {
        let conn = self.conn();
        let row = require_path(&conn, target)?;
        load_policy(&conn, row.id)
    }

    pub fn status(&self, target: &ResolvedTarget) -> Result<Vec<ScheduleStatus>> {
        let conn = self.conn();
        let row = require_path(&conn, target)?;
        statuses_for(&conn, row)
    }

    /// Status of every cadence, optionally restricted to one filesystem.
    pub fn status_all(&self, fs_name: Option<&str>) -> Result<Vec<ScheduleStatus>> {
        let conn = self.conn();
        let rows = {
            let mut stmt = conn.prepare_cached(&format!(
                "{PATH_SELECT} WHERE ?1 IS NULL OR fs_name = ?1 ORDER BY fs_name, path"
            ))?;
            let rows = stmt
                .query_map([fs_name], path_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let mut out = Vec::new();
        for row in rows {
            out.extend(statuses_for(&conn, row)?);
        }
        Ok(out)
    }

    pub fn active_schedules(&self) -> Result<Vec<ScheduleRecord>> {
        let conn = self.conn();
        query_records(
            &conn,
            &format!("{RECORD_SELECT} WHERE m.active = 1 ORDER BY m.schedule_id, m.slot"),
            [],
        )
    }

    /// Active cadences with a fire instant due at `now`, grouped by path and
    /// ordered by slot within a path.
    pub fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>> {
        Ok(self
            .active_schedules()?
            .into_iter()
            .filter(|r| r.due_fire(now).is_some())
            .collect())
    }

    pub fn prune_targets(&self) -> Result<Vec<PruneTarget>> {
        let conn = self.conn();
        let rows = {
            let mut stmt = conn.prepare_cached(&format!(
                "{PATH_SELECT} s
                 WHERE EXISTS (SELECT 1 FROM schedules_meta m WHERE m.schedule_id = s.id AND m.active = 1)
                   AND EXISTS (SELECT 1 FROM retention r WHERE r.schedule_id = s.id)
                 ORDER BY s.id"
            ))?;
            let rows = stmt
                .query_map([], path_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter()
            .map(|row| {
                Ok(PruneTarget {
                    path_id: row.id,
                    policy: load_policy(&conn, row.id)?,
                    target: row.target,
                })
            })
            .collect()
    }

    pub fn record_pruned(&self, path_id: i64, count: u64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE schedules SET pruned_count = pruned_count + ?2, last_pruned = ?3 WHERE id = ?1",
            params![path_id, count as i64, ts(at)],
        )?;
        Ok(())
    }

    /// Drop every schedule at or below `prefix` on `fs_name`, e.g. when a
    /// subvolume is deleted. Returns the number of paths removed.
    pub fn remove_subtree(&self, fs_name: &str, prefix: &str) -> Result<usize> {
        let conn = self.conn();
        let prefix = prefix.trim_end_matches('/');
        let removed = if prefix.is_empty() {
            conn.execute("DELETE FROM schedules WHERE fs_name = ?1", [fs_name])?
        } else {
            conn.execute(
                "DELETE FROM schedules
                 WHERE fs_name = ?1
                   AND (path = ?2 OR substr(path, 1, length(?2) + 1) = ?2 || '/')",
                params![fs_name, prefix],
            )?
        };
        if removed > 0 {
            info!(fs = %fs_name, %prefix, removed, "schedules removed with subtree");
        } else {
            debug!(fs = %fs_name, %prefix, "no schedules under subtree");
        }
        Ok(removed)
    }

    /// Number of cadence rows, active or not.
    pub fn schedule_count(&self) -> Result<usize> {
        let conn = self.conn();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM schedules_meta", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

// --- private helpers -------------------------------------------------------

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn conversion(idx: usize, e: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.to_string().into())
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| conversion(idx, e)),
        None => Ok(None),
    }
}

fn get_cadence(row: &Row<'_>, idx: usize) -> rusqlite::Result<Cadence> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion(idx, e))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleRecord> {
    Ok(ScheduleRecord {
        id: row.get(0)?,
        path_id: row.get(1)?,
        target: ResolvedTarget {
            fs_name: row.get(2)?,
            path: row.get(3)?,
            rel_path: row.get(4)?,
            subvol: row.get(5)?,
            group: row.get(6)?,
        },
        cadence: get_cadence(row, 7)?,
        slot: row.get::<_, i64>(8)? as u32,
        state: ScheduleState {
            start: get_ts(row, 9)?,
            active: row.get(10)?,
            created_count: row.get::<_, i64>(11)? as u64,
            last_fired_at: get_opt_ts(row, 12)?,
            last_missed_at: get_opt_ts(row, 13)?,
            consecutive_failures: row.get::<_, i64>(14)? as u32,
            first_failure_at: get_opt_ts(row, 15)?,
            created_at: get_ts(row, 16)?,
        },
    })
}

fn path_from_row(row: &Row<'_>) -> rusqlite::Result<PathRow> {
    Ok(PathRow {
        id: row.get(0)?,
        target: ResolvedTarget {
            fs_name: row.get(1)?,
            path: row.get(2)?,
            rel_path: row.get(3)?,
            subvol: row.get(4)?,
            group: row.get(5)?,
        },
        pruned_count: row.get::<_, i64>(6)? as u64,
        last_pruned: get_opt_ts(row, 7)?,
    })
}

fn query_records<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<ScheduleRecord>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let records = stmt
        .query_map(params, record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

fn fetch_record(conn: &Connection, id: i64) -> Result<Option<ScheduleRecord>> {
    let record = conn
        .query_row(
            &format!("{RECORD_SELECT} WHERE m.id = ?1"),
            [id],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

fn find_path(conn: &Connection, target: &ResolvedTarget) -> Result<Option<PathRow>> {
    let row = conn
        .query_row(
            &format!("{PATH_SELECT} WHERE fs_name = ?1 AND path = ?2"),
            params![target.fs_name, target.path],
            path_from_row,
        )
        .optional()?;
    Ok(row)
}

fn require_path(conn: &Connection, target: &ResolvedTarget) -> Result<PathRow> {
    let row = find_path(conn, target)?.ok_or_else(|| SchedulerError::NotFound {
        target: target.to_string(),
    })?;
    check_scope(&row, target)?;
    Ok(row)
}

/// A path scheduled through a subvolume must be addressed through that
/// subvolume, and a bare path as a bare path.
fn check_scope(row: &PathRow, target: &ResolvedTarget) -> Result<()> {
    if target.same_scope(row.target.subvol.as_deref(), row.target.group.as_deref()) {
        return Ok(());
    }
    let scheduled_as = match (&row.target.subvol, &row.target.group) {
        (Some(sv), Some(g)) => format!("subvolume {sv} in group {g}"),
        (Some(sv), None) => format!("subvolume {sv}"),
        _ => "a plain path".to_string(),
    };
    Err(SchedulerError::Conflict {
        target: target.to_string(),
        reason: format!("scheduled as {scheduled_as}"),
    })
}

fn not_found(target: &ResolvedTarget, cadence: Option<Cadence>) -> SchedulerError {
    SchedulerError::NotFound {
        target: match cadence {
            Some(c) => format!("{target} ({c})"),
            None => target.to_string(),
        },
    }
}

fn load_policy(conn: &Connection, path_id: i64) -> Result<RetentionPolicy> {
    let mut stmt =
        conn.prepare_cached("SELECT period, keep_count FROM retention WHERE schedule_id = ?1")?;
    let rows = stmt
        .query_map([path_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|(period, count)| RetentionSpec::from_parts(&period, count as u32))
        .collect()
}

fn statuses_for(conn: &Connection, row: PathRow) -> Result<Vec<ScheduleStatus>> {
    let retention = load_policy(conn, row.id)?.to_map();
    let records = query_records(
        conn,
        &format!("{RECORD_SELECT} WHERE m.schedule_id = ?1 ORDER BY m.slot"),
        [row.id],
    )?;
    Ok(records
        .into_iter()
        .map(|rec| ScheduleStatus {
            fs_name: row.target.fs_name.clone(),
            path: row.target.path.clone(),
            subvol: row.target.subvol.clone(),
            group: row.target.group.clone(),
            cadence: rec.cadence,
            start: rec.state.start,
            active: rec.state.active,
            created_count: rec.state.created_count,
            pruned_count: row.pruned_count,
            last_fired_at: rec.state.last_fired_at,
            last_pruned_at: row.last_pruned,
            last_missed_at: rec.state.last_missed_at,
            next_fire_at: if rec.state.active { rec.next_fire() } else { None },
            consecutive_failures: rec.state.consecutive_failures,
            first_failure_at: rec.state.first_failure_at,
            retention: retention.clone(),
            health: Health::of(&rec.state),
        })
        .collect())
}
