use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use snapsched_core::SnapschedConfig;
use tracing::debug;

use crate::error::{AccessError, SchedulerError};
use crate::types::{ResolvedTarget, Target};

/// Subvolumes that were created without a group live here.
pub const DEFAULT_GROUP_DIR: &str = "_nogroup";
const VOLUMES_DIR: &str = "volumes";

/// Filesystem operations the engine needs. Implementations must be safe to
/// call from many tasks at once.
#[async_trait]
pub trait PathAccessor: Send + Sync {
    /// Map a caller-supplied target onto one directory of one filesystem.
    async fn resolve(&self, target: &Target) -> Result<ResolvedTarget, AccessError>;

    async fn create_snapshot(&self, target: &ResolvedTarget, name: &str) -> Result<(), AccessError>;

    /// Every entry in the target's snapshot directory, sorted by name.
    async fn list_snapshots(&self, target: &ResolvedTarget) -> Result<Vec<String>, AccessError>;

    async fn delete_snapshot(&self, target: &ResolvedTarget, name: &str) -> Result<(), AccessError>;
}

/// Snapshots as plain directories under `<dir>/<snap_dir_name>/`, one local
/// root per configured filesystem. On a CephFS mount the snapshot directory
/// is virtual and `mkdir`/`rmdir` in it take and drop real snapshots.
#[derive(Debug, Clone)]
pub struct LocalSnapDir {
    roots: BTreeMap<String, PathBuf>,
    snap_dir_name: String,
}

impl LocalSnapDir {
    pub fn new<I, S, P>(roots: I, snap_dir_name: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = (S, P)>,
        S: Into<String>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots
                .into_iter()
                .map(|(name, root)| (name.into(), root.into()))
                .collect(),
            snap_dir_name: snap_dir_name.into(),
        }
    }

    pub fn from_config(config: &SnapschedConfig) -> Result<Self, SchedulerError> {
        if config.filesystems.is_empty() {
            return Err(SchedulerError::Config(
                "no filesystems configured".to_string(),
            ));
        }
        Ok(Self::new(
            config
                .filesystems
                .iter()
                .map(|fs| (fs.name.clone(), PathBuf::from(&fs.root))),
            config.snapshots.snap_dir_name.clone(),
        ))
    }

    fn root(&self, fs_name: &str) -> Result<&Path, AccessError> {
        self.roots
            .get(fs_name)
            .map(PathBuf::as_path)
            .ok_or_else(|| AccessError::NotFound(format!("filesystem {fs_name}")))
    }

    fn pick_fs(&self, requested: Option<&str>) -> Result<String, AccessError> {
        match requested {
            Some(name) => self.root(name).map(|_| name.to_string()),
            None => {
                let mut names = self.roots.keys();
                match (names.next(), names.next()) {
                    (Some(only), None) => Ok(only.clone()),
                    (None, _) => Err(AccessError::NotFound("no filesystems configured".into())),
                    _ => Err(AccessError::AmbiguousScope(
                        "more than one filesystem configured; name one".into(),
                    )),
                }
            }
        }
    }

    /// Local directory backing a resolved target.
    pub fn dir_of(&self, target: &ResolvedTarget) -> Result<PathBuf, AccessError> {
        Ok(self
            .root(&target.fs_name)?
            .join(target.path.trim_start_matches('/')))
    }

    fn snap_dir_of(&self, target: &ResolvedTarget) -> Result<PathBuf, AccessError> {
        Ok(self.dir_of(target)?.join(&self.snap_dir_name))
    }

    async fn resolve_subvol(
        &self,
        root: &Path,
        subvol: &str,
        group: Option<&str>,
    ) -> Result<String, AccessError> {
        check_component("subvolume", subvol)?;
        if let Some(g) = group {
            check_component("group", g)?;
        }
        let group_dir = group.unwrap_or(DEFAULT_GROUP_DIR);
        let subvol_path = root.join(VOLUMES_DIR).join(group_dir).join(subvol);
        if is_dir(&subvol_path).await {
            return Ok(format!("/{VOLUMES_DIR}/{group_dir}/{subvol}"));
        }

        if group.is_none() {
            if let Some(owner) = find_owning_group(root, subvol).await {
                return Err(AccessError::AmbiguousScope(format!(
                    "subvolume {subvol} belongs to group {owner}; pass the group"
                )));
            }
        }
        Err(AccessError::NotFound(match group {
            Some(g) => format!("subvolume {subvol} in group {g}"),
            None => format!("subvolume {subvol}"),
        }))
    }
}

#[async_trait]
impl PathAccessor for LocalSnapDir {
    async fn resolve(&self, target: &Target) -> Result<ResolvedTarget, AccessError> {
        let fs_name = self.pick_fs(target.fs_name.as_deref())?;
        let rel_path = normalize_path(&target.path)?;

        let path = match (target.subvol.as_deref(), target.group.as_deref()) {
            (None, Some(g)) => {
                return Err(AccessError::AmbiguousScope(format!(
                    "group {g} given without a subvolume"
                )))
            }
            (None, None) => rel_path.clone(),
            (Some(sv), group) => {
                let base = self.resolve_subvol(self.root(&fs_name)?, sv, group).await?;
                if rel_path == "/" {
                    base
                } else {
                    format!("{base}{rel_path}")
                }
            }
        };

        debug!(fs = %fs_name, %path, "target resolved");
        Ok(ResolvedTarget {
            fs_name,
            path,
            rel_path,
            subvol: target.subvol.clone(),
            group: target.group.clone(),
        })
    }

    async fn create_snapshot(&self, target: &ResolvedTarget, name: &str) -> Result<(), AccessError> {
        check_component("snapshot", name)?;
        let dir = self.dir_of(target)?;
        if !is_dir(&dir).await {
            return Err(AccessError::NotFound(target.to_string()));
        }
        let snap_dir = dir.join(&self.snap_dir_name);
        tokio::fs::create_dir_all(&snap_dir)
            .await
            .map_err(|e| io_error(&snap_dir, e))?;

        let entry = snap_dir.join(name);
        match tokio::fs::create_dir(&entry).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(AccessError::AlreadyExists(name.to_string()))
            }
            Err(e) => Err(io_error(&entry, e)),
        }
    }

    async fn list_snapshots(&self, target: &ResolvedTarget) -> Result<Vec<String>, AccessError> {
        let snap_dir = self.snap_dir_of(target)?;
        let mut entries = match tokio::fs::read_dir(&snap_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // no snapshot directory yet is fine; a missing target is not
                return if is_dir(&self.dir_of(target)?).await {
                    Ok(Vec::new())
                } else {
                    Err(AccessError::NotFound(target.to_string()))
                };
            }
            Err(e) => return Err(io_error(&snap_dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&snap_dir, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete_snapshot(&self, target: &ResolvedTarget, name: &str) -> Result<(), AccessError> {
        check_component("snapshot", name)?;
        let entry = self.snap_dir_of(target)?.join(name);
        match tokio::fs::remove_dir(&entry).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(AccessError::NotFound(name.to_string())),
            Err(e) => Err(io_error(&entry, e)),
        }
    }
}

/// Absolute, slash-separated form of a user path: `.` segments dropped,
/// duplicate and trailing slashes removed, `..` rejected.
pub fn normalize_path(path: &str) -> Result<String, AccessError> {
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => match part.to_str() {
                Some(s) => parts.push(s),
                None => return Err(AccessError::NotFound(path.to_string())),
            },
            Component::ParentDir | Component::Prefix(_) => {
                return Err(AccessError::NotFound(format!("{path}: '..' is not allowed")))
            }
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

fn check_component(kind: &str, name: &str) -> Result<(), AccessError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(AccessError::NotFound(format!("invalid {kind} name {name:?}")));
    }
    Ok(())
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

async fn find_owning_group(root: &Path, subvol: &str) -> Option<String> {
    let mut groups = tokio::fs::read_dir(root.join(VOLUMES_DIR)).await.ok()?;
    while let Ok(Some(group)) = groups.next_entry().await {
        let name = group.file_name().to_str()?.to_string();
        if name != DEFAULT_GROUP_DIR && is_dir(&group.path().join(subvol)).await {
            return Some(name);
        }
    }
    None
}

fn io_error(path: &Path, source: std::io::Error) -> AccessError {
    if source.kind() == ErrorKind::NotFound {
        return AccessError::NotFound(path.display().to_string());
    }
    AccessError::Io {
        path: path.display().to_string(),
        source,
    }
}
