use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::types::ScheduleState;

/// Observed health of one cadence, derived from its persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded {
        consecutive_failures: u32,
        since: DateTime<Utc>,
    },
    Deactivated,
}

impl Health {
    pub fn of(state: &ScheduleState) -> Self {
        if !state.active {
            return Health::Deactivated;
        }
        match (state.consecutive_failures, state.first_failure_at) {
            (0, _) | (_, None) => Health::Healthy,
            (n, Some(since)) => Health::Degraded {
                consecutive_failures: n,
                since,
            },
        }
    }
}

/// What to do after recording a failed fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// Keep the schedule active; the window closes after `remaining`.
    Retry { remaining: Duration },
    Deactivate,
}

/// Decides when a failing schedule has failed for long enough to deactivate.
///
/// The window is measured from the first failure of the current run, so the
/// decision survives restarts.
#[derive(Debug, Clone, Copy)]
pub struct FailureTracker {
    window: Duration,
}

impl FailureTracker {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window: Duration::seconds(window_secs.min(u32::MAX as u64) as i64),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn evaluate(&self, state: &ScheduleState, now: DateTime<Utc>) -> Verdict {
        if state.consecutive_failures == 0 {
            return Verdict::Healthy;
        }
        let since = state.first_failure_at.unwrap_or(now);
        let elapsed = now - since;
        if elapsed >= self.window {
            Verdict::Deactivate
        } else {
            Verdict::Retry {
                remaining: self.window - elapsed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn state(failures: u32, first: Option<DateTime<Utc>>) -> ScheduleState {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        ScheduleState {
            active: true,
            created_count: 0,
            start: t0,
            last_fired_at: None,
            last_missed_at: None,
            consecutive_failures: failures,
            first_failure_at: first,
            created_at: t0,
        }
    }

    #[test]
    fn healthy_without_failures() {
        let tracker = FailureTracker::new(60);
        let s = state(0, None);
        assert_eq!(tracker.evaluate(&s, Utc::now()), Verdict::Healthy);
        assert_eq!(Health::of(&s), Health::Healthy);
    }

    #[test]
    fn deactivates_exactly_when_window_elapses() {
        let tracker = FailureTracker::new(60);
        let first = Utc.with_ymd_and_hms(2026, 3, 1, 10, 1, 0).unwrap();
        let s = state(1, Some(first));

        assert_eq!(
            tracker.evaluate(&s, first),
            Verdict::Retry {
                remaining: Duration::seconds(60)
            }
        );
        assert_eq!(
            tracker.evaluate(&s, first + Duration::seconds(59)),
            Verdict::Retry {
                remaining: Duration::seconds(1)
            }
        );
        assert_eq!(
            tracker.evaluate(&s, first + Duration::seconds(60)),
            Verdict::Deactivate
        );
    }

    #[test]
    fn health_tracks_state() {
        let first = Utc.with_ymd_and_hms(2026, 3, 1, 10, 1, 0).unwrap();
        let mut s = state(3, Some(first));
        assert_eq!(
            Health::of(&s),
            Health::Degraded {
                consecutive_failures: 3,
                since: first
            }
        );
        s.active = false;
        assert_eq!(Health::of(&s), Health::Deactivated);
    }
}
