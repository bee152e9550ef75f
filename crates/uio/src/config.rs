//! Mount tables in RON.
//!
//! A [`MountConfig`] lists mounts in the order they are applied:
//!
//! ```ron
//! (
//!     entries: [
//!         (mount_point: "/", fs: "stdio", in_path: "/usr/share/game", read_only: true),
//!         (mount_point: "/", fs: "zip", source: Some("/packs/base.zip"), location: below(0)),
//!     ],
//! )
//! ```
//!
//! `above(n)` and `below(n)` refer to the mount created by entry `n`, which
//! must come earlier in the list.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::automount::apply_auto_mounts;
use crate::error::VfsError;
use crate::paths::split_last;
use crate::repository::{MountHandle, MountRequest, Repository};
use crate::types::{AutoMount, MountLocation};

/// Errors from loading or applying a mount table.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("mount failed: {0}")]
    Vfs(#[from] VfsError),
    #[error("unknown filesystem '{0}'")]
    UnknownFileSystem(String),
    #[error("entry {entry} refers to entry {target}, which is not an earlier one")]
    BadReference { entry: usize, target: usize },
}

/// Placement of a configured mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryLocation {
    #[default]
    Top,
    Bottom,
    Above(usize),
    Below(usize),
}

/// One mount of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    pub mount_point: String,
    /// Registered filesystem name, matched without regard to case.
    pub fs: String,
    /// Virtual path of a file in the repository holding the filesystem.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub in_path: String,
    #[serde(default)]
    pub location: EntryLocation,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub auto_mount: Vec<AutoMount>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    #[serde(default)]
    pub entries: Vec<MountEntry>,
}

impl MountConfig {
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron(&text)
    }

    /// Mount every entry into `repo`, in order.
    ///
    /// Entries with auto-mount rules get them applied to their mount point
    /// right away. Stops at the first failing entry; mounts made so far
    /// stay in place.
    pub fn apply(&self, repo: &Repository) -> Result<Vec<MountHandle>, ConfigError> {
        let mut handles: Vec<MountHandle> = Vec::with_capacity(self.entries.len());

        for (index, entry) in self.entries.iter().enumerate() {
            let fs_id = repo
                .registry()
                .lookup(&entry.fs)
                .ok_or_else(|| ConfigError::UnknownFileSystem(entry.fs.clone()))?;

            let earlier = |target: usize| {
                handles
                    .get(target)
                    .ok_or(ConfigError::BadReference { entry: index, target })
            };
            let location = match entry.location {
                EntryLocation::Top => MountLocation::Top,
                EntryLocation::Bottom => MountLocation::Bottom,
                EntryLocation::Above(target) => MountLocation::Above(earlier(target)?),
                EntryLocation::Below(target) => MountLocation::Below(earlier(target)?),
            };

            let source = match &entry.source {
                Some(path) => {
                    let (dir, name) = split_last(path);
                    Some((repo.open_dir(dir, false)?, name.to_string()))
                }
                None => None,
            };

            let mut req = MountRequest::new(fs_id)
                .in_path(&entry.in_path)
                .read_only(entry.read_only)
                .auto_mount(entry.auto_mount.clone())
                .location(location);
            if let Some((dir, name)) = &source {
                req = req.source(dir, name);
            }
            let handle = repo.mount_dir(&entry.mount_point, req)?;

            if !entry.auto_mount.is_empty() {
                let dir = repo.open_dir(&entry.mount_point, false)?;
                apply_auto_mounts(repo, &handle, &dir)?;
            }
            handles.push(handle);
        }

        info!(mounts = handles.len(), "applied mount table");
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Uio;
    use crate::fstypes::FileSystemId;
    use crate::pattern::MatchType;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (Repository, TempDir) {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("base")).unwrap();
        fs::create_dir(tmp.path().join("user")).unwrap();
        fs::write(tmp.path().join("base").join("a.txt"), "base").unwrap();
        (Uio::init().open_repository(), tmp)
    }

    #[test]
    fn test_parse_defaults() {
        let config = MountConfig::from_ron(
            r#"(entries: [
                (mount_point: "/", fs: "stdio"),
                (mount_point: "/x", fs: "zip", source: Some("/a.zip"), location: below(0),
                 auto_mount: [(pattern: "*.zip", match_type: glob, fs_id: 2)]),
            ])"#,
        )
        .unwrap();
        assert_eq!(config.entries.len(), 2);
        let first = &config.entries[0];
        assert_eq!(first.location, EntryLocation::Top);
        assert!(!first.read_only);
        assert!(first.in_path.is_empty());
        let second = &config.entries[1];
        assert_eq!(second.location, EntryLocation::Below(0));
        assert_eq!(second.source.as_deref(), Some("/a.zip"));
        assert_eq!(second.auto_mount[0].match_type, MatchType::Glob);
        assert_eq!(second.auto_mount[0].fs_id, FileSystemId::ZIP);
        assert!(second.auto_mount[0].read_only);
    }

    #[test]
    fn test_parse_error() {
        let err = MountConfig::from_ron("(entries: [(fs: )])").unwrap_err();
        assert!(matches!(err, ConfigError::Ron(_)));
    }

    #[test]
    fn test_apply() {
        let (repo, tmp) = setup();
        let config = MountConfig {
            entries: vec![
                MountEntry {
                    mount_point: "/".to_string(),
                    fs: "STDIO".to_string(),
                    source: None,
                    in_path: tmp.path().join("base").to_string_lossy().into_owned(),
                    location: EntryLocation::Top,
                    read_only: true,
                    auto_mount: Vec::new(),
                },
                MountEntry {
                    mount_point: "/".to_string(),
                    fs: "stdio".to_string(),
                    source: None,
                    in_path: tmp.path().join("user").to_string_lossy().into_owned(),
                    location: EntryLocation::Above(0),
                    read_only: false,
                    auto_mount: Vec::new(),
                },
            ],
        };
        let handles = config.apply(&repo).unwrap();
        let order: Vec<_> = repo.mounts().iter().map(MountHandle::id).collect();
        assert_eq!(order, vec![handles[1].id(), handles[0].id()]);

        let top = repo.open_dir("/", false).unwrap();
        let (mount, _) = top
            .get_file_location("a.txt", crate::types::OpenFlags::read_write())
            .unwrap();
        assert_eq!(mount, handles[1]);
    }

    #[test]
    fn test_apply_errors() {
        let (repo, _tmp) = setup();
        let unknown = MountConfig::from_ron(r#"(entries: [(mount_point: "/", fs: "nfs")])"#)
            .unwrap();
        assert!(matches!(
            unknown.apply(&repo),
            Err(ConfigError::UnknownFileSystem(name)) if name == "nfs"
        ));

        let forward = MountConfig::from_ron(
            r#"(entries: [(mount_point: "/", fs: "stdio", location: above(1))])"#,
        )
        .unwrap();
        assert!(matches!(
            forward.apply(&repo),
            Err(ConfigError::BadReference { entry: 0, target: 1 })
        ));
    }
}
