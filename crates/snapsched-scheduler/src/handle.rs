use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    accessor::PathAccessor,
    cadence::{Cadence, Period},
    error::{Result, SchedulerError},
    retention::RetentionSpec,
    store::ScheduleStore,
    types::{ScheduleListing, ScheduleRecord, ScheduleStatus, Target},
};

/// Management surface for schedules while the engine loop runs.
///
/// Every call resolves the target through the [`PathAccessor`] and then
/// delegates to the shared [`ScheduleStore`].
#[derive(Clone)]
pub struct SnapScheduleHandle {
    store: Arc<ScheduleStore>,
    accessor: Arc<dyn PathAccessor>,
    allow_minute_granularity: bool,
}

impl SnapScheduleHandle {
    pub fn new(
        store: Arc<ScheduleStore>,
        accessor: Arc<dyn PathAccessor>,
        allow_minute_granularity: bool,
    ) -> Self {
        Self {
            store,
            accessor,
            allow_minute_granularity,
        }
    }

    pub fn store(&self) -> &Arc<ScheduleStore> {
        &self.store
    }

    /// Schedule `cadence` at `target`. The fire grid is anchored on `start`
    /// (default: now).
    pub async fn add_schedule(
        &self,
        target: &Target,
        cadence: &str,
        start: Option<DateTime<Utc>>,
    ) -> Result<ScheduleRecord> {
        let cadence: Cadence = cadence.parse()?;
        if cadence.period() == Period::Minute && !self.allow_minute_granularity {
            return Err(SchedulerError::InvalidCadenceSpec(format!(
                "{cadence}: minute granularity is disabled"
            )));
        }
        let resolved = self.accessor.resolve(target).await?;
        let now = Utc::now();
        self.store
            .add_schedule(&resolved, cadence, start.unwrap_or(now), now)
    }

    /// Remove one cadence, or all of them when `cadence` is `None`.
    pub async fn remove_schedule(&self, target: &Target, cadence: Option<&str>) -> Result<usize> {
        let cadence = parse_optional(cadence)?;
        let resolved = self.accessor.resolve(target).await?;
        self.store.remove_schedule(&resolved, cadence)
    }

    pub async fn list_schedules(&self, target: &Target) -> Result<ScheduleListing> {
        let resolved = self.accessor.resolve(target).await?;
        self.store.list_schedules(&resolved)
    }

    pub async fn activate(&self, target: &Target, cadence: Option<&str>) -> Result<usize> {
        self.set_active(target, cadence, true).await
    }

    pub async fn deactivate(&self, target: &Target, cadence: Option<&str>) -> Result<usize> {
        self.set_active(target, cadence, false).await
    }

    async fn set_active(&self, target: &Target, cadence: Option<&str>, active: bool) -> Result<usize> {
        let cadence = parse_optional(cadence)?;
        let resolved = self.accessor.resolve(target).await?;
        self.store.set_active(&resolved, cadence, active, Utc::now())
    }

    pub async fn add_retention(&self, target: &Target, spec: RetentionSpec) -> Result<()> {
        let resolved = self.accessor.resolve(target).await?;
        self.store.add_retention(&resolved, spec)
    }

    pub async fn remove_retention(&self, target: &Target, spec: RetentionSpec) -> Result<()> {
        let resolved = self.accessor.resolve(target).await?;
        self.store.remove_retention(&resolved, spec)
    }

    pub async fn status(&self, target: &Target) -> Result<Vec<ScheduleStatus>> {
        let resolved = self.accessor.resolve(target).await?;
        self.store.status(&resolved)
    }

    pub fn status_all(&self, fs_name: Option<&str>) -> Result<Vec<ScheduleStatus>> {
        self.store.status_all(fs_name)
    }

    /// Forget every schedule at or below `target`, e.g. after its subvolume
    /// was deleted.
    pub async fn remove_subtree(&self, target: &Target) -> Result<usize> {
        let resolved = self.accessor.resolve(target).await?;
        self.store.remove_subtree(&resolved.fs_name, &resolved.path)
    }
}

fn parse_optional(cadence: Option<&str>) -> Result<Option<Cadence>> {
    cadence.map(str::parse::<Cadence>).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AccessError;
    use crate::types::ResolvedTarget;
    use async_trait::async_trait;

    /// Resolves everything as a bare path; never touches a filesystem.
    struct BarePaths;

    #[async_trait]
    impl PathAccessor for BarePaths {
        async fn resolve(&self, target: &Target) -> std::result::Result<ResolvedTarget, AccessError> {
            if target.path == "/gone" {
                return Err(AccessError::NotFound(target.path.clone()));
            }
            Ok(ResolvedTarget {
                fs_name: "cephfs".into(),
                path: target.path.clone(),
                rel_path: target.path.clone(),
                subvol: None,
                group: None,
            })
        }
        async fn create_snapshot(&self, _: &ResolvedTarget, _: &str) -> std::result::Result<(), AccessError> {
            Ok(())
        }
        async fn list_snapshots(&self, _: &ResolvedTarget) -> std::result::Result<Vec<String>, AccessError> {
            Ok(Vec::new())
        }
        async fn delete_snapshot(&self, _: &ResolvedTarget, _: &str) -> std::result::Result<(), AccessError> {
            Ok(())
        }
    }

    fn handle(allow_minutes: bool) -> SnapScheduleHandle {
        SnapScheduleHandle::new(
            Arc::new(ScheduleStore::open_in_memory().unwrap()),
            Arc::new(BarePaths),
            allow_minutes,
        )
    }

    #[tokio::test]
    async fn minute_cadence_needs_opt_in() {
        let h = handle(false);
        let err = h
            .add_schedule(&Target::path("/a"), "1m", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CADENCE_SPEC");
        h.add_schedule(&Target::path("/a"), "1h", None).await.unwrap();

        let h = handle(true);
        h.add_schedule(&Target::path("/a"), "1m", None).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_specs_rejected_before_resolution() {
        let h = handle(true);
        for spec in ["1X", "1MM", "1", "M", "-1m", ""] {
            let err = h
                .add_schedule(&Target::path("/gone"), spec, None)
                .await
                .unwrap_err();
            assert_eq!(err.code(), "INVALID_CADENCE_SPEC", "{spec:?}");
        }
        let err = h
            .add_schedule(&Target::path("/gone"), "1h", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PATH_NOT_FOUND");
    }

    #[tokio::test]
    async fn list_after_remove_is_not_found() {
        let h = handle(false);
        let target = Target::path("/a");
        h.add_schedule(&target, "1h", None).await.unwrap();
        h.add_retention(&target, RetentionSpec::from_parts("h", 5).unwrap())
            .await
            .unwrap();
        let listing = h.list_schedules(&target).await.unwrap();
        assert_eq!(listing.retention.get("h"), Some(&5));

        h.remove_schedule(&target, Some("1h")).await.unwrap();
        let err = h.list_schedules(&target).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        let err = h.status(&target).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn deactivate_and_reactivate() {
        let h = handle(false);
        let target = Target::path("/a");
        h.add_schedule(&target, "1h", None).await.unwrap();
        h.add_schedule(&target, "1d", None).await.unwrap();

        assert_eq!(h.deactivate(&target, Some("1d")).await.unwrap(), 1);
        let listing = h.list_schedules(&target).await.unwrap();
        assert!(listing.active);
        assert!(!listing.schedules.iter().find(|s| s.cadence.to_string() == "1d").unwrap().active);

        assert_eq!(h.deactivate(&target, None).await.unwrap(), 2);
        assert!(!h.list_schedules(&target).await.unwrap().active);
        assert_eq!(h.activate(&target, None).await.unwrap(), 2);
        assert!(h.status_all(None).unwrap().iter().all(|s| s.active));

        let err = h.activate(&target, Some("1w")).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn subtree_removal_via_handle() {
        let h = handle(false);
        h.add_schedule(&Target::path("/vol/a"), "1h", None).await.unwrap();
        h.add_schedule(&Target::path("/vol/b"), "1h", None).await.unwrap();
        h.add_schedule(&Target::path("/other"), "1h", None).await.unwrap();
        assert_eq!(h.remove_subtree(&Target::path("/vol")).await.unwrap(), 2);
        assert_eq!(h.status_all(None).unwrap().len(), 1);
    }
}
