// Shared fixtures for the scheduler integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use snapsched_core::config::SchedulerConfig;
use snapsched_scheduler::{
    AccessError, PathAccessor, ResolvedTarget, ScheduleStore, SchedulerEngine,
    SnapScheduleHandle, Target,
};

pub type CreateHook = Box<dyn Fn(&ResolvedTarget, &str) + Send + Sync>;

/// Snapshot directories kept in memory, keyed by resolved path.
#[derive(Default)]
pub struct MemoryAccessor {
    snaps: Mutex<BTreeMap<String, BTreeSet<String>>>,
    missing: Mutex<HashSet<String>>,
    hook: Mutex<Option<CreateHook>>,
    creates: Mutex<usize>,
}

impl MemoryAccessor {
    /// Make every operation on `path` fail as if the directory vanished.
    pub fn break_path(&self, path: &str) {
        self.missing.lock().unwrap().insert(path.to_string());
    }

    pub fn repair_path(&self, path: &str) {
        self.missing.lock().unwrap().remove(path);
    }

    /// Run `hook` just before each create attempt.
    pub fn on_create(&self, hook: CreateHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    pub fn names(&self, path: &str) -> Vec<String> {
        self.snaps
            .lock()
            .unwrap()
            .get(path)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn create_attempts(&self) -> usize {
        *self.creates.lock().unwrap()
    }

    fn is_missing(&self, path: &str) -> bool {
        self.missing.lock().unwrap().contains(path)
    }
}

#[async_trait]
impl PathAccessor for MemoryAccessor {
    async fn resolve(&self, target: &Target) -> Result<ResolvedTarget, AccessError> {
        let rel = format!("/{}", target.path.trim_matches('/'));
        let path = match (&target.subvol, &target.group) {
            (None, Some(g)) => {
                return Err(AccessError::AmbiguousScope(format!("group {g} without subvolume")))
            }
            (None, None) => rel.clone(),
            (Some(sv), group) => {
                let group = group.as_deref().unwrap_or("_nogroup");
                if rel == "/" {
                    format!("/volumes/{group}/{sv}")
                } else {
                    format!("/volumes/{group}/{sv}{rel}")
                }
            }
        };
        Ok(ResolvedTarget {
            fs_name: target.fs_name.clone().unwrap_or_else(|| "cephfs".into()),
            path,
            rel_path: rel,
            subvol: target.subvol.clone(),
            group: target.group.clone(),
        })
    }

    async fn create_snapshot(&self, target: &ResolvedTarget, name: &str) -> Result<(), AccessError> {
        *self.creates.lock().unwrap() += 1;
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(target, name);
        }
        if self.is_missing(&target.path) {
            return Err(AccessError::NotFound(target.path.clone()));
        }
        let mut snaps = self.snaps.lock().unwrap();
        if !snaps
            .entry(target.path.clone())
            .or_default()
            .insert(name.to_string())
        {
            return Err(AccessError::AlreadyExists(name.to_string()));
        }
        Ok(())
    }

    async fn list_snapshots(&self, target: &ResolvedTarget) -> Result<Vec<String>, AccessError> {
        if self.is_missing(&target.path) {
            return Err(AccessError::NotFound(target.path.clone()));
        }
        Ok(self.names(&target.path))
    }

    async fn delete_snapshot(&self, target: &ResolvedTarget, name: &str) -> Result<(), AccessError> {
        let mut snaps = self.snaps.lock().unwrap();
        if snaps.get_mut(&target.path).is_some_and(|set| set.remove(name)) {
            Ok(())
        } else {
            Err(AccessError::NotFound(name.to_string()))
        }
    }
}

pub struct Harness {
    pub store: Arc<ScheduleStore>,
    pub accessor: Arc<MemoryAccessor>,
    pub handle: SnapScheduleHandle,
    pub engine: SchedulerEngine,
}

pub fn harness() -> Harness {
    harness_with(SchedulerConfig {
        allow_minute_granularity: true,
        ..SchedulerConfig::default()
    })
}

pub fn harness_with(config: SchedulerConfig) -> Harness {
    let store = Arc::new(ScheduleStore::open_in_memory().unwrap());
    harness_on(store, config)
}

pub fn harness_on(store: Arc<ScheduleStore>, config: SchedulerConfig) -> Harness {
    let accessor = Arc::new(MemoryAccessor::default());
    let handle = SnapScheduleHandle::new(
        store.clone(),
        accessor.clone(),
        config.allow_minute_granularity,
    );
    let engine = SchedulerEngine::new(store.clone(), accessor.clone(), &config);
    Harness {
        store,
        accessor,
        handle,
        engine,
    }
}

/// 2026-03-01 at the given UTC wall-clock time.
pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
}

pub fn minutes_after(t: DateTime<Utc>, n: i64) -> DateTime<Utc> {
    t + chrono::Duration::minutes(n)
}
