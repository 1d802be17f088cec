use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60; // finest cadence is one minute
pub const DEFAULT_FAILURE_WINDOW_SECS: u64 = 60;
pub const DEFAULT_MAX_WORKERS: usize = 8;
pub const DEFAULT_MAX_SNAPSHOTS_PER_PATH: usize = 100;
pub const DEFAULT_EVENT_BUFFER: usize = 256;
pub const DEFAULT_SNAP_DIR_NAME: &str = ".snap";
pub const DEFAULT_FS_NAME: &str = "cephfs";

/// Top-level config (snapsched.toml + SNAPSCHED_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapschedConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub snapshots: SnapshotsConfig,
    /// Filesystems the daemon may schedule against, addressed by name.
    #[serde(default = "default_filesystems")]
    pub filesystems: Vec<FilesystemConfig>,
}

impl Default for SnapschedConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            database: DatabaseConfig::default(),
            snapshots: SnapshotsConfig::default(),
            filesystems: default_filesystems(),
        }
    }
}

/// Tuning for the tick loop and the failure state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between ticks. Ticks land on Unix-epoch multiples of this
    /// value, so 60 ticks on every wall-clock minute.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// How long a failing schedule may keep failing before it is deactivated.
    #[serde(default = "default_failure_window")]
    pub failure_window_secs: u64,
    /// Upper bound on targets serviced concurrently within one tick.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Minute cadences (`1m`, `5m`, ...) are rejected unless this is set.
    #[serde(default)]
    pub allow_minute_granularity: bool,
    /// Ceiling on snapshots retained per path once any retention rule exists.
    /// An `Nn` rule with a larger N raises it for that path.
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots_per_path: usize,
    /// Capacity of the broadcast channel carrying scheduler events.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            failure_window_secs: DEFAULT_FAILURE_WINDOW_SECS,
            max_workers: DEFAULT_MAX_WORKERS,
            allow_minute_granularity: false,
            max_snapshots_per_path: DEFAULT_MAX_SNAPSHOTS_PER_PATH,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Milliseconds a writer waits on a locked database before giving up.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotsConfig {
    /// Name of the per-directory snapshot namespace (`.snap` on CephFS).
    #[serde(default = "default_snap_dir_name")]
    pub snap_dir_name: String,
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            snap_dir_name: default_snap_dir_name(),
        }
    }
}

/// A named filesystem and the local directory it is mounted at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilesystemConfig {
    pub name: String,
    pub root: String,
}

fn default_tick_interval() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}
fn default_failure_window() -> u64 {
    DEFAULT_FAILURE_WINDOW_SECS
}
fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}
fn default_max_snapshots() -> usize {
    DEFAULT_MAX_SNAPSHOTS_PER_PATH
}
fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}
fn default_busy_timeout() -> u64 {
    5_000
}
fn default_snap_dir_name() -> String {
    DEFAULT_SNAP_DIR_NAME.to_string()
}
fn default_db_path() -> String {
    format!("{}/snapsched.db", home_dir())
}
fn default_filesystems() -> Vec<FilesystemConfig> {
    vec![FilesystemConfig {
        name: DEFAULT_FS_NAME.to_string(),
        root: "/mnt/cephfs".to_string(),
    }]
}

impl SnapschedConfig {
    /// Load config from a TOML file with SNAPSCHED_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `SNAPSCHED_SCHEDULER__ALLOW_MINUTE_GRANULARITY=true`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: SnapschedConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SNAPSCHED_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        config.validate()?;
        tracing::debug!(
            path = %path,
            filesystems = config.filesystems.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::CoreError;

        if self.scheduler.tick_interval_secs == 0 {
            return Err(CoreError::Config(
                "scheduler.tick_interval_secs must be positive".to_string(),
            ));
        }
        if self.scheduler.max_workers == 0 {
            return Err(CoreError::Config(
                "scheduler.max_workers must be positive".to_string(),
            ));
        }
        if self.scheduler.max_snapshots_per_path == 0 {
            return Err(CoreError::Config(
                "scheduler.max_snapshots_per_path must be positive".to_string(),
            ));
        }
        if self.snapshots.snap_dir_name.is_empty() || self.snapshots.snap_dir_name.contains('/') {
            return Err(CoreError::Config(format!(
                "invalid snapshots.snap_dir_name: {:?}",
                self.snapshots.snap_dir_name
            )));
        }
        let mut names: Vec<&str> = self.filesystems.iter().map(|f| f.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(CoreError::Config(
                "filesystem names must be unique".to_string(),
            ));
        }
        Ok(())
    }
}

fn home_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.snapsched", home)
}

fn default_config_path() -> String {
    format!("{}/snapsched.toml", home_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = SnapschedConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.filesystems[0].name, DEFAULT_FS_NAME);
        assert_eq!(config.scheduler.tick_interval_secs, 60);
        assert!(!config.scheduler.allow_minute_granularity);
        assert_eq!(config.snapshots.snap_dir_name, ".snap");
    }

    #[test]
    fn load_reads_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
allow_minute_granularity = true
failure_window_secs = 120

[database]
path = "/tmp/snapsched-test.db"

[[filesystems]]
name = "backup_fs"
root = "/srv/backup"
"#
        )
        .unwrap();

        let config = SnapschedConfig::load(file.path().to_str()).unwrap();
        assert!(config.scheduler.allow_minute_granularity);
        assert_eq!(config.scheduler.failure_window_secs, 120);
        assert_eq!(config.scheduler.max_workers, DEFAULT_MAX_WORKERS);
        assert_eq!(config.database.path, "/tmp/snapsched-test.db");
        assert_eq!(config.filesystems.len(), 1);
        assert_eq!(config.filesystems[0].name, "backup_fs");
    }

    #[test]
    fn duplicate_filesystem_names_rejected() {
        let config = SnapschedConfig {
            filesystems: vec![
                FilesystemConfig {
                    name: "a".into(),
                    root: "/a".into(),
                },
                FilesystemConfig {
                    name: "a".into(),
                    root: "/b".into(),
                },
            ],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_tick_interval_rejected() {
        let mut config = SnapschedConfig::default();
        config.scheduler.tick_interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
