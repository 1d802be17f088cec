use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Prefix shared by every snapshot this scheduler creates.
pub const SNAPSHOT_PREFIX: &str = "scheduled-";
/// Fixed-width UTC timestamp, so names sort by creation time.
pub const SNAPSHOT_TS_FORMAT: &str = "%Y-%m-%d-%H_%M_%S";
const SNAPSHOT_TS_LEN: usize = 19;

/// Time unit of a cadence or retention bucket.
///
/// Months and years are fixed 30- and 365-day spans; fire times sit on a
/// grid of whole seconds rather than calendar months.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Period {
    pub const ALL: [Period; 6] = [
        Period::Minute,
        Period::Hour,
        Period::Day,
        Period::Week,
        Period::Month,
        Period::Year,
    ];

    pub fn from_suffix(c: char) -> Option<Self> {
        match c {
            'm' => Some(Period::Minute),
            'h' => Some(Period::Hour),
            'd' => Some(Period::Day),
            'w' => Some(Period::Week),
            'M' => Some(Period::Month),
            'y' => Some(Period::Year),
            _ => None,
        }
    }

    pub fn suffix(self) -> char {
        match self {
            Period::Minute => 'm',
            Period::Hour => 'h',
            Period::Day => 'd',
            Period::Week => 'w',
            Period::Month => 'M',
            Period::Year => 'y',
        }
    }

    pub fn seconds(self) -> u64 {
        match self {
            Period::Minute => 60,
            Period::Hour => 60 * 60,
            Period::Day => 60 * 60 * 24,
            Period::Week => 60 * 60 * 24 * 7,
            Period::Month => 60 * 60 * 24 * 30,
            Period::Year => 60 * 60 * 24 * 365,
        }
    }

    /// strftime pattern whose output is identical for two instants in the same bucket.
    pub fn bucket_format(self) -> &'static str {
        match self {
            Period::Minute => "%Y-%m-%d-%H_%M",
            Period::Hour => "%Y-%m-%d-%H",
            Period::Day => "%Y-%m-%d",
            Period::Week => "%G-%V",
            Period::Month => "%Y-%m",
            Period::Year => "%Y",
        }
    }
}

/// A validated `<N><unit>` cadence, e.g. `1h` or `15m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cadence {
    count: u32,
    period: Period,
}

impl Cadence {
    pub fn new(count: u32, period: Period) -> Result<Self> {
        if count == 0 {
            return Err(SchedulerError::InvalidCadenceSpec(format!(
                "{count}{}: period must be positive",
                period.suffix()
            )));
        }
        Ok(Self { count, period })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn period(&self) -> Period {
        self.period
    }

    /// Length of one cadence step in seconds.
    pub fn timeout_seconds(&self) -> u64 {
        self.count as u64 * self.period.seconds()
    }
}

impl FromStr for Cadence {
    type Err = SchedulerError;

    fn from_str(spec: &str) -> Result<Self> {
        let (count, period) = split_spec(spec)
            .ok_or_else(|| SchedulerError::InvalidCadenceSpec(format!("{spec:?}")))?;
        let period = Period::from_suffix(period).ok_or_else(|| {
            SchedulerError::InvalidCadenceSpec(format!("{spec:?}: unknown unit '{period}'"))
        })?;
        Cadence::new(count, period)
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.period.suffix())
    }
}

impl TryFrom<String> for Cadence {
    type Error = SchedulerError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Cadence> for String {
    fn from(c: Cadence) -> Self {
        c.to_string()
    }
}

/// Split `<digits><char>` into its parts. Signs, whitespace and empty
/// digit runs are rejected.
pub(crate) fn split_spec(spec: &str) -> Option<(u32, char)> {
    let unit = spec.chars().last()?;
    let digits = &spec[..spec.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((digits.parse().ok()?, unit))
}

/// Seconds per cadence step for a raw spec string.
pub fn timeout_seconds(spec: &str) -> Result<u64> {
    Ok(spec.parse::<Cadence>()?.timeout_seconds())
}

/// Delay from `now_epoch` until the first fire of a cadence added at `now_epoch`:
/// the current minute boundary plus one cadence step.
pub fn seconds_until_next_boundary(now_epoch: i64, timeout_seconds: u64) -> i64 {
    (now_epoch.div_euclid(60) * 60) + timeout_seconds as i64 - now_epoch
}

/// `scheduled-YYYY-MM-DD-HH_MM_SS` for the given instant (UTC).
pub fn canonical_snapshot_name(fire: DateTime<Utc>) -> String {
    format!("{SNAPSHOT_PREFIX}{}", fire.format(SNAPSHOT_TS_FORMAT))
}

/// Inverse of [`canonical_snapshot_name`]. Returns `None` for anything the
/// scheduler did not create.
pub fn parse_snapshot_name(name: &str) -> Option<DateTime<Utc>> {
    let ts = name.strip_prefix(SNAPSHOT_PREFIX)?;
    if ts.len() != SNAPSHOT_TS_LEN {
        return None;
    }
    NaiveDateTime::parse_from_str(ts, SNAPSHOT_TS_FORMAT)
        .ok()
        .map(|dt| dt.and_utc())
}

/// Grid origin for a schedule started at `start`: the enclosing minute boundary.
pub fn anchor(start: DateTime<Utc>) -> i64 {
    start.timestamp().div_euclid(60) * 60
}

/// Latest grid instant `anchor + k·timeout` (k ≥ 1) not after `now`.
pub fn latest_fire_at_or_before(anchor: i64, timeout_seconds: u64, now: i64) -> Option<i64> {
    let step = timeout_seconds as i64;
    if step <= 0 || now < anchor.saturating_add(step) {
        return None;
    }
    let k = (now - anchor) / step;
    Some(anchor + k * step)
}

/// First grid instant strictly after `cursor`.
pub fn next_fire_after(anchor: i64, timeout_seconds: u64, cursor: i64) -> i64 {
    let step = timeout_seconds as i64;
    if cursor < anchor {
        return anchor.saturating_add(step);
    }
    let k = (cursor - anchor) / step + 1;
    anchor.saturating_add(k.saturating_mul(step))
}
