use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use snapsched_core::config::SchedulerConfig;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

use crate::{
    accessor::PathAccessor,
    error::{AccessError, Result},
    events::{EventBus, SchedulerEvent},
    failure::{FailureTracker, Verdict},
    retention::{self, RetentionPolicy},
    store::ScheduleStore,
    types::{FireOutcome, ResolvedTarget, ScheduleRecord},
};

/// Counts from one tick, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub created: usize,
    pub pruned: usize,
    pub failed: usize,
    pub deactivated: usize,
    pub prune_errors: usize,
}

impl TickReport {
    pub fn merge(&mut self, other: TickReport) {
        self.created += other.created;
        self.pruned += other.pruned;
        self.failed += other.failed;
        self.deactivated += other.deactivated;
        self.prune_errors += other.prune_errors;
    }

    pub fn is_empty(&self) -> bool {
        *self == TickReport::default()
    }
}

/// Everything one path needs serviced during a tick.
struct PathWork {
    path_id: i64,
    target: ResolvedTarget,
    due: Vec<ScheduleRecord>,
    policy: Option<RetentionPolicy>,
}

/// Drives snapshot creation and pruning on a wall-clock aligned tick.
pub struct SchedulerEngine {
    store: Arc<ScheduleStore>,
    accessor: Arc<dyn PathAccessor>,
    tracker: FailureTracker,
    events: EventBus,
    tick_interval_secs: u64,
    max_workers: usize,
    max_snapshots_per_path: usize,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<ScheduleStore>,
        accessor: Arc<dyn PathAccessor>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            accessor,
            tracker: FailureTracker::new(config.failure_window_secs),
            events: EventBus::new(config.event_buffer),
            tick_interval_secs: config.tick_interval_secs.max(1),
            max_workers: config.max_workers.max(1),
            max_snapshots_per_path: config.max_snapshots_per_path,
        }
    }

    /// Event bus; clone it before [`run`](Self::run) consumes the engine.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<SchedulerEvent> {
        self.events.event_stream()
    }

    /// Main loop. Ticks on multiples of the tick interval until `shutdown`
    /// broadcasts `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_secs = self.tick_interval_secs,
            max_workers = self.max_workers,
            "scheduler engine started"
        );
        if let Err(e) = self.mark_missed_on_startup(Utc::now()) {
            error!("missed-on-startup scan failed: {e}");
        }

        loop {
            let (boundary, delay) = self.delay_until_next_tick(Utc::now());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    // Never tick before the boundary even if the clocks disagree.
                    let now = Utc::now().max(boundary);
                    match self.tick_at(now).await {
                        Ok(report) if !report.is_empty() => info!(
                            created = report.created,
                            pruned = report.pruned,
                            failed = report.failed,
                            deactivated = report.deactivated,
                            prune_errors = report.prune_errors,
                            "tick complete"
                        ),
                        Ok(_) => debug!("tick complete, nothing due"),
                        Err(e) => error!("scheduler tick error: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Mark every fire instant that passed while the engine was down as
    /// missed, so the first tick does not backfill it.
    pub fn mark_missed_on_startup(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut marked = 0;
        for rec in self.store.active_schedules()? {
            if let Some(fire) = rec.due_fire(now) {
                self.store.mark_missed(rec.id, fire)?;
                marked += 1;
            }
        }
        if marked > 0 {
            warn!(count = marked, "schedules marked missed on startup");
        }
        Ok(marked)
    }

    /// Next tick boundary after `now` and how long to sleep until it.
    pub fn delay_until_next_tick(&self, now: DateTime<Utc>) -> (DateTime<Utc>, Duration) {
        let step = self.tick_interval_secs as i64;
        let next = (now.timestamp().div_euclid(step) + 1) * step;
        let boundary = Utc.timestamp_opt(next, 0).single().unwrap_or(now);
        let delay = (boundary - now).to_std().unwrap_or(Duration::ZERO);
        (boundary, delay)
    }

    /// One pass over every due schedule and every prunable path, as of `now`.
    ///
    /// Paths are serviced concurrently on at most `max_workers` tasks; within
    /// a path, creation precedes pruning. A failing path never affects others.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut work: BTreeMap<i64, PathWork> = BTreeMap::new();
        for rec in self.store.due_schedules(now)? {
            work.entry(rec.path_id)
                .or_insert_with(|| PathWork {
                    path_id: rec.path_id,
                    target: rec.target.clone(),
                    due: Vec::new(),
                    policy: None,
                })
                .due
                .push(rec);
        }
        for pt in self.store.prune_targets()? {
            work.entry(pt.path_id)
                .or_insert_with(|| PathWork {
                    path_id: pt.path_id,
                    target: pt.target.clone(),
                    due: Vec::new(),
                    policy: None,
                })
                .policy = Some(pt.policy);
        }

        let reports: Vec<TickReport> = stream::iter(work.into_values())
            .map(|w| self.service_target(w, now))
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        let mut total = TickReport::default();
        for r in reports {
            total.merge(r);
        }
        Ok(total)
    }

    async fn service_target(&self, work: PathWork, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        for rec in &work.due {
            if let Err(e) = self.fire(rec, now, &mut report).await {
                error!(path = %rec.target, cadence = %rec.cadence, "fire failed: {e}");
            }
        }
        if let Some(policy) = &work.policy {
            if let Err(e) = self
                .prune(work.path_id, &work.target, policy, now, &mut report)
                .await
            {
                report.prune_errors += 1;
                error!(path = %work.target, "prune failed: {e}");
            }
        }
        report
    }

    async fn fire(
        &self,
        rec: &ScheduleRecord,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        // The schedule may have been removed or deactivated since the due scan.
        if !self.store.is_active(rec.id)? {
            debug!(path = %rec.target, cadence = %rec.cadence, "skipping inactive schedule");
            return Ok(());
        }
        let Some(fire_at) = rec.due_fire(now) else {
            return Ok(());
        };
        let name = rec.snapshot_name(fire_at);

        match self.accessor.create_snapshot(&rec.target, &name).await {
            Ok(()) | Err(AccessError::AlreadyExists(_)) => {
                let state = self
                    .store
                    .record_fired(rec.id, FireOutcome::Created { fire_at })?;
                report.created += 1;
                info!(
                    path = %rec.target,
                    cadence = %rec.cadence,
                    %name,
                    created_count = state.created_count,
                    "snapshot created"
                );
                self.events.emit(SchedulerEvent::Created {
                    target: rec.target.to_string(),
                    cadence: rec.cadence.to_string(),
                    name,
                });
            }
            Err(e) => {
                let state = self
                    .store
                    .record_fired(rec.id, FireOutcome::Failed { at: now })?;
                report.failed += 1;
                warn!(
                    path = %rec.target,
                    cadence = %rec.cadence,
                    failures = state.consecutive_failures,
                    "snapshot create failed: {e}"
                );
                self.events.emit(SchedulerEvent::Failed {
                    target: rec.target.to_string(),
                    cadence: rec.cadence.to_string(),
                    error: e.to_string(),
                    consecutive_failures: state.consecutive_failures,
                });

                match self.tracker.evaluate(&state, now) {
                    Verdict::Deactivate => {
                        if self.store.deactivate(rec.id)? {
                            report.deactivated += 1;
                            warn!(
                                path = %rec.target,
                                cadence = %rec.cadence,
                                window_secs = self.tracker.window().num_seconds(),
                                "schedule deactivated after repeated failures"
                            );
                            self.events.emit(SchedulerEvent::Deactivated {
                                target: rec.target.to_string(),
                                cadence: rec.cadence.to_string(),
                            });
                        }
                    }
                    Verdict::Retry { remaining } => debug!(
                        path = %rec.target,
                        cadence = %rec.cadence,
                        remaining_secs = remaining.num_seconds(),
                        "will retry"
                    ),
                    Verdict::Healthy => {}
                }
            }
        }
        Ok(())
    }

    async fn prune(
        &self,
        path_id: i64,
        target: &ResolvedTarget,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let names = match self.accessor.list_snapshots(target).await {
            Ok(names) => names,
            // creation already reports a missing path
            Err(AccessError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let doomed = retention::prune_set(&names, policy, true, self.max_snapshots_per_path);
        let mut pruned = 0u64;
        for name in doomed {
            match self.accessor.delete_snapshot(target, &name).await {
                Ok(()) => {
                    pruned += 1;
                    debug!(path = %target, %name, "snapshot pruned");
                    self.events.emit(SchedulerEvent::Pruned {
                        target: target.to_string(),
                        name,
                    });
                }
                Err(AccessError::NotFound(_)) => {
                    debug!(path = %target, %name, "snapshot already gone");
                }
                Err(e) => {
                    report.prune_errors += 1;
                    warn!(path = %target, %name, "prune delete failed: {e}");
                }
            }
        }

        if pruned > 0 {
            self.store.record_pruned(path_id, pruned, now)?;
            report.pruned += pruned as usize;
            info!(path = %target, pruned, "snapshots pruned");
        }
        Ok(())
    }
}
