//! Retention rules and the prune-set computation.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cadence::{parse_snapshot_name, split_spec, Period};
use crate::error::{Result, SchedulerError};

/// What a retention rule counts: raw entries (`n`) or time buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RetentionPeriod {
    Count,
    Bucket(Period),
}

impl RetentionPeriod {
    pub fn letter(self) -> char {
        match self {
            RetentionPeriod::Count => 'n',
            RetentionPeriod::Bucket(p) => p.suffix(),
        }
    }

    pub fn from_letter(c: char) -> Option<Self> {
        if c == 'n' {
            return Some(RetentionPeriod::Count);
        }
        Period::from_suffix(c).map(RetentionPeriod::Bucket)
    }
}

/// One `<N><n|m|h|d|w|M|y>` rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionSpec {
    pub period: RetentionPeriod,
    pub count: u32,
}

impl RetentionSpec {
    /// Build from the split `(period, count)` form, e.g. `("h", 5)`.
    pub fn from_parts(period: &str, count: u32) -> Result<Self> {
        let mut chars = period.chars();
        let letter = match (chars.next(), chars.next()) {
            (Some(c), None) => c,
            _ => {
                return Err(SchedulerError::InvalidRetentionSpec(format!(
                    "{period:?}: period must be one letter"
                )))
            }
        };
        let period = RetentionPeriod::from_letter(letter).ok_or_else(|| {
            SchedulerError::InvalidRetentionSpec(format!("{letter:?}: unknown period"))
        })?;
        if count == 0 {
            return Err(SchedulerError::InvalidRetentionSpec(format!(
                "0{letter}: count must be positive"
            )));
        }
        Ok(Self { period, count })
    }
}

impl FromStr for RetentionSpec {
    type Err = SchedulerError;

    fn from_str(spec: &str) -> Result<Self> {
        let (count, letter) = split_spec(spec)
            .ok_or_else(|| SchedulerError::InvalidRetentionSpec(format!("{spec:?}")))?;
        RetentionSpec::from_parts(&letter.to_string(), count)
    }
}

impl fmt::Display for RetentionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.period.letter())
    }
}

/// All rules attached to one path, at most one per period letter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    rules: BTreeMap<RetentionPeriod, u32>,
}

impl RetentionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if a rule for that period already exists.
    pub fn insert(&mut self, spec: RetentionSpec) -> bool {
        if self.rules.contains_key(&spec.period) {
            return false;
        }
        self.rules.insert(spec.period, spec.count);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn specs(&self) -> impl Iterator<Item = RetentionSpec> + '_ {
        self.rules
            .iter()
            .map(|(&period, &count)| RetentionSpec { period, count })
    }

    /// Rules keyed by period letter, for listings.
    pub fn to_map(&self) -> BTreeMap<String, u32> {
        self.specs()
            .map(|s| (s.period.letter().to_string(), s.count))
            .collect()
    }
}

impl FromIterator<RetentionSpec> for RetentionPolicy {
    fn from_iter<I: IntoIterator<Item = RetentionSpec>>(iter: I) -> Self {
        let mut policy = RetentionPolicy::new();
        for spec in iter {
            policy.insert(spec);
        }
        policy
    }
}

/// Names to delete, oldest first.
///
/// Only scheduler-owned names are considered. A name survives if any rule
/// keeps it; the surviving set is then capped at the `max_keep` newest, or
/// at the largest `Nn` count when that is higher. With no rules nothing is
/// pruned. While a schedule is active the newest entry is always kept.
pub fn prune_set(
    names: &[String],
    policy: &RetentionPolicy,
    schedule_active: bool,
    max_keep: usize,
) -> Vec<String> {
    if policy.is_empty() {
        return Vec::new();
    }

    let mut owned: Vec<(&str, chrono::DateTime<chrono::Utc>)> = names
        .iter()
        .filter_map(|n| parse_snapshot_name(n).map(|ts| (n.as_str(), ts)))
        .collect();
    // newest first
    owned.sort_by(|a, b| b.0.cmp(a.0));
    owned.dedup_by(|a, b| a.0 == b.0);

    let mut keep: HashSet<&str> = HashSet::new();
    for spec in policy.specs() {
        let limit = spec.count as usize;
        match spec.period {
            RetentionPeriod::Count => {
                keep.extend(owned.iter().take(limit).map(|(n, _)| *n));
            }
            RetentionPeriod::Bucket(period) => {
                let fmt = period.bucket_format();
                let mut last_bucket: Option<String> = None;
                let mut buckets = 0usize;
                for (name, ts) in &owned {
                    if buckets == limit {
                        break;
                    }
                    let bucket = ts.format(fmt).to_string();
                    if last_bucket.as_deref() != Some(bucket.as_str()) {
                        keep.insert(*name);
                        buckets += 1;
                        last_bucket = Some(bucket);
                    }
                }
            }
        }
    }

    // an explicit count rule is never truncated by the cap
    let cap = policy
        .specs()
        .filter(|s| s.period == RetentionPeriod::Count)
        .map(|s| s.count as usize)
        .fold(max_keep, usize::max);

    let mut kept = 0usize;
    let mut doomed: Vec<String> = Vec::new();
    for (name, _) in &owned {
        if keep.contains(name) && kept < cap {
            kept += 1;
        } else {
            doomed.push(name.to_string());
        }
    }

    if schedule_active {
        if let Some((newest, _)) = owned.first() {
            doomed.retain(|n| n != newest);
        }
    }

    doomed.reverse();
    doomed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadence::canonical_snapshot_name;
    use chrono::{Duration, TimeZone, Utc};

    fn names_every(step: Duration, count: i64) -> Vec<String> {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        (0..count)
            .map(|i| canonical_snapshot_name(base + step * i as i32))
            .collect()
    }

    fn policy(specs: &[&str]) -> RetentionPolicy {
        specs.iter().map(|s| s.parse::<RetentionSpec>().unwrap()).collect()
    }

    #[test]
    fn parse_forms() {
        let s: RetentionSpec = "5h".parse().unwrap();
        assert_eq!(s.period, RetentionPeriod::Bucket(Period::Hour));
        assert_eq!(s.count, 5);
        assert_eq!(RetentionSpec::from_parts("h", 5).unwrap(), s);
        assert_eq!("10n".parse::<RetentionSpec>().unwrap().period, RetentionPeriod::Count);
        assert_eq!(s.to_string(), "5h");

        for bad in ["", "n", "5", "0h", "5x", "-1h", "5hh"] {
            let err = bad.parse::<RetentionSpec>().unwrap_err();
            assert_eq!(err.code(), "INVALID_RETENTION_SPEC", "{bad:?}");
        }
        assert!(RetentionSpec::from_parts("hh", 5).is_err());
        assert!(RetentionSpec::from_parts("h", 0).is_err());
    }

    #[test]
    fn no_rules_prunes_nothing() {
        let names = names_every(Duration::minutes(1), 10);
        assert!(prune_set(&names, &RetentionPolicy::new(), true, 100).is_empty());
    }

    #[test]
    fn count_rule_keeps_newest() {
        let names = names_every(Duration::minutes(1), 60);
        let doomed = prune_set(&names, &policy(&["55n"]), true, 100);
        assert_eq!(doomed.len(), 5);
        assert_eq!(doomed, names[..5].to_vec());
    }

    #[test]
    fn bucket_rule_keeps_newest_per_bucket() {
        // 15-minute spacing over 3 hours: 4 entries per hour
        let names = names_every(Duration::minutes(15), 12);
        let doomed = prune_set(&names, &policy(&["2h"]), true, 100);
        let kept: Vec<&String> = names.iter().filter(|n| !doomed.contains(n)).collect();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0], &names[7]); // 01:45
        assert_eq!(kept[1], &names[11]); // 02:45
    }

    #[test]
    fn union_of_rules() {
        let names = names_every(Duration::minutes(15), 12);
        // 1n keeps 02:45 only; 3h keeps 00:45, 01:45, 02:45
        let doomed = prune_set(&names, &policy(&["1n", "3h"]), true, 100);
        assert_eq!(doomed.len(), 9);
        assert!(!doomed.contains(&names[3]));
        assert!(!doomed.contains(&names[7]));
        assert!(!doomed.contains(&names[11]));

        // 4n protects 02:00..02:45 on top of the hourly picks
        let doomed = prune_set(&names, &policy(&["4n", "3h"]), true, 100);
        assert_eq!(doomed.len(), 6);
    }

    #[test]
    fn foreign_names_untouched() {
        let mut names = names_every(Duration::minutes(1), 5);
        names.push("manual".into());
        names.push("scheduled-bogus".into());
        let doomed = prune_set(&names, &policy(&["1n"]), true, 100);
        assert_eq!(doomed.len(), 4);
        assert!(doomed.iter().all(|n| parse_snapshot_name(n).is_some()));
    }

    #[test]
    fn cap_limits_kept_set() {
        let names = names_every(Duration::minutes(1), 30);
        let doomed = prune_set(&names, &policy(&["20m"]), true, 10);
        assert_eq!(doomed.len(), 20);
        assert_eq!(doomed.last().unwrap(), &names[19]);
    }

    #[test]
    fn count_rule_above_cap_is_honoured() {
        let names = names_every(Duration::minutes(1), 150);
        let doomed = prune_set(&names, &policy(&["120n"]), true, 100);
        assert_eq!(doomed, names[..30].to_vec());

        // bucket keeps beyond the largest count are still capped
        let doomed = prune_set(&names, &policy(&["120n", "150m"]), true, 100);
        assert_eq!(doomed.len(), 30);
    }

    #[test]
    fn newest_never_pruned_while_active() {
        let names = names_every(Duration::minutes(7), 40);
        let newest = names.last().unwrap();
        let cases: [&[&str]; 5] = [&["1n"], &["2h"], &["1d", "3n"], &["1y"], &["5m", "1w"]];
        for specs in cases {
            for max_keep in 1..=3 {
                let doomed = prune_set(&names, &policy(specs), true, max_keep);
                assert!(!doomed.contains(newest), "{specs:?} cap {max_keep}");
                assert!(doomed.len() < names.len());
            }
        }
    }

    #[test]
    fn newest_survives_while_active() {
        let names = names_every(Duration::minutes(1), 3);
        // a zero cap would drop everything
        let doomed = prune_set(&names, &policy(&["1m"]), true, 0);
        assert_eq!(doomed, names[..2].to_vec());

        let doomed = prune_set(&names, &policy(&["1m"]), false, 0);
        assert_eq!(doomed.len(), 3);
    }

    #[test]
    fn weekly_buckets_use_iso_weeks() {
        // 2026-03-01 is a Sunday, 03-02 a Monday: different ISO weeks
        let names = vec![
            "scheduled-2026-02-28-12_00_00".to_string(),
            "scheduled-2026-03-01-12_00_00".to_string(),
            "scheduled-2026-03-02-12_00_00".to_string(),
        ];
        let doomed = prune_set(&names, &policy(&["2w"]), true, 100);
        assert_eq!(doomed, vec!["scheduled-2026-02-28-12_00_00".to_string()]);
    }
}
