use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Args, Parser, Subcommand};
use snapsched_scheduler::{RetentionSpec, Target};

use crate::output::OutputFormat;

/// Clock-aligned snapshot scheduling for directory trees and subvolumes.
#[derive(Parser, Debug)]
#[command(name = "snapsched", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file (default: $SNAPSCHED_CONFIG, then ~/.snapsched/snapsched.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Output format for command results
    #[arg(long, value_enum, default_value_t = OutputFormat::Plain, global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler loop until interrupted
    Serve,

    /// Add a snapshot schedule
    Add {
        #[command(flatten)]
        target: TargetArgs,
        /// Cadence, e.g. 1h, 1d, 2w (minutes need allow_minute_granularity)
        cadence: String,
        /// Grid anchor, RFC 3339 or `YYYY-MM-DDTHH:MM:SS` in UTC (default: now)
        start: Option<String>,
    },

    /// Remove one cadence, or every schedule at the path
    Remove {
        #[command(flatten)]
        target: TargetArgs,
        cadence: Option<String>,
    },

    /// List the schedules and retention rules at a path
    List {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Per-cadence status; every schedule when no path is given
    Status {
        path: Option<String>,
        #[arg(long)]
        fs: Option<String>,
        #[arg(long)]
        subvol: Option<String>,
        #[arg(long)]
        group: Option<String>,
    },

    /// Activate one cadence, or all at the path
    Activate {
        #[command(flatten)]
        target: TargetArgs,
        cadence: Option<String>,
    },

    /// Deactivate one cadence, or all at the path
    Deactivate {
        #[command(flatten)]
        target: TargetArgs,
        cadence: Option<String>,
    },

    /// Forget every schedule at or below a path
    Purge {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Manage retention rules
    Retention {
        #[command(subcommand)]
        action: RetentionCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum RetentionCommand {
    /// Add a rule, e.g. `5h`, `10n`, or `h 5`
    Add {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        spec: RetentionArgs,
    },
    /// Remove a rule; period and count must both match
    Remove {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        spec: RetentionArgs,
    },
}

#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Directory path (relative to the subvolume when --subvol is given)
    pub path: String,
    /// Filesystem name; required when more than one is configured
    #[arg(long)]
    pub fs: Option<String>,
    #[arg(long)]
    pub subvol: Option<String>,
    /// Subvolume group; only valid together with --subvol
    #[arg(long)]
    pub group: Option<String>,
}

impl TargetArgs {
    pub fn to_target(&self) -> Target {
        build_target(&self.path, &self.fs, &self.subvol, &self.group)
    }
}

pub fn build_target(
    path: &str,
    fs: &Option<String>,
    subvol: &Option<String>,
    group: &Option<String>,
) -> Target {
    Target {
        fs_name: fs.clone(),
        path: path.to_string(),
        subvol: subvol.clone(),
        group: group.clone(),
    }
}

#[derive(Args, Debug)]
pub struct RetentionArgs {
    /// `<N><n|m|h|d|w|M|y>`, or just the period letter when COUNT follows
    pub spec: String,
    pub count: Option<u32>,
}

impl RetentionArgs {
    pub fn parse(&self) -> snapsched_scheduler::Result<RetentionSpec> {
        match self.count {
            Some(count) => RetentionSpec::from_parts(&self.spec, count),
            None => self.spec.parse(),
        }
    }
}

/// RFC 3339, or a naive timestamp taken as UTC.
pub fn parse_start(s: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M"))
        .map_err(|e| anyhow::anyhow!("invalid start time {s:?}: {e}"))?;
    Ok(naive.and_utc())
}
