use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// One `schedules` row per (filesystem, path), one `schedules_meta` row per
/// cadence at that path, one `retention` row per (path, period letter).
/// Cadence and retention rows go away with their path row.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS schedules (
            id            INTEGER NOT NULL PRIMARY KEY,
            fs_name       TEXT    NOT NULL,
            path          TEXT    NOT NULL,   -- absolute inside the filesystem
            rel_path      TEXT    NOT NULL,   -- as given, relative to subvol if any
            subvol        TEXT,
            group_name    TEXT,
            pruned_count  INTEGER NOT NULL DEFAULT 0,
            last_pruned   TEXT,               -- RFC 3339 or NULL
            created_at    TEXT    NOT NULL,
            UNIQUE (fs_name, path)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS schedules_meta (
            id                    INTEGER NOT NULL PRIMARY KEY,
            schedule_id           INTEGER NOT NULL
                                  REFERENCES schedules (id) ON DELETE CASCADE,
            cadence               TEXT    NOT NULL,   -- e.g. '1h'
            period_secs           INTEGER NOT NULL,
            start                 TEXT    NOT NULL,
            active                INTEGER NOT NULL DEFAULT 1,
            created_count         INTEGER NOT NULL DEFAULT 0,
            last_fired            TEXT,
            last_missed           TEXT,
            consecutive_failures  INTEGER NOT NULL DEFAULT 0,
            first_failure         TEXT,
            created_at            TEXT    NOT NULL,
            UNIQUE (schedule_id, cadence)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS retention (
            schedule_id  INTEGER NOT NULL
                         REFERENCES schedules (id) ON DELETE CASCADE,
            period       TEXT    NOT NULL,   -- n, m, h, d, w, M, y
            keep_count   INTEGER NOT NULL,
            PRIMARY KEY (schedule_id, period)
        ) STRICT;

        -- The tick only ever scans active cadences.
        CREATE INDEX IF NOT EXISTS idx_schedules_meta_active ON schedules_meta (active);
        ",
    )?;
    Ok(())
}
