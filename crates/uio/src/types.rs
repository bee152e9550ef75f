//! Core VFS types.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::fstypes::FileSystemId;
use crate::pattern::MatchType;

/// File type enumeration.
///
/// Backends only ever expose files and directories; anything else on the
/// host (devices, sockets, dangling links) is treated as absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// File attributes (metadata).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttr {
    /// Size in bytes.
    pub size: u64,
    /// File type.
    pub kind: FileType,
    /// Unix permission bits (e.g., 0o644).
    pub perm: u32,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Last access time (optional).
    pub atime: Option<SystemTime>,
    /// Status change time (optional).
    pub ctime: Option<SystemTime>,
    /// User ID (optional, for host-backed filesystems).
    pub uid: Option<u32>,
    /// Group ID (optional, for host-backed filesystems).
    pub gid: Option<u32>,
}

impl FileAttr {
    /// Attributes for a file with no recorded timestamps.
    pub fn file(size: u64, perm: u32) -> Self {
        Self {
            size,
            kind: FileType::File,
            perm,
            mtime: SystemTime::UNIX_EPOCH,
            atime: None,
            ctime: None,
            uid: None,
            gid: None,
        }
    }

    /// Attributes for a directory with no recorded timestamps.
    pub fn directory(perm: u32) -> Self {
        Self {
            size: 0,
            kind: FileType::Directory,
            perm,
            mtime: SystemTime::UNIX_EPOCH,
            atime: None,
            ctime: None,
            uid: None,
            gid: None,
        }
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// Requested access direction of an open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Open file flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    /// Read/write direction.
    pub access: AccessMode,
    /// Writes go to the end of the file.
    pub append: bool,
    /// Create if not exists.
    pub create: bool,
    /// Truncate on open.
    pub truncate: bool,
    /// Exclusive create (fail if exists).
    pub exclusive: bool,
}

impl OpenFlags {
    /// Read-only access.
    pub fn read() -> Self {
        Self::default()
    }

    /// Write-only access.
    pub fn write() -> Self {
        Self {
            access: AccessMode::WriteOnly,
            ..Default::default()
        }
    }

    /// Read and write access.
    pub fn read_write() -> Self {
        Self {
            access: AccessMode::ReadWrite,
            ..Default::default()
        }
    }

    /// Create with write access.
    pub fn create() -> Self {
        Self {
            access: AccessMode::WriteOnly,
            create: true,
            ..Default::default()
        }
    }

    /// Create exclusively (fail if exists).
    pub fn create_exclusive() -> Self {
        Self {
            access: AccessMode::WriteOnly,
            create: true,
            exclusive: true,
            ..Default::default()
        }
    }

    /// Create and truncate.
    pub fn create_truncate() -> Self {
        Self {
            access: AccessMode::WriteOnly,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }

    /// Set the access direction.
    pub fn with_access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    /// Enable append mode.
    pub fn with_append(mut self) -> Self {
        self.append = true;
        self
    }

    /// Returns true if the handle may be read from.
    pub fn readable(&self) -> bool {
        self.access != AccessMode::WriteOnly
    }

    /// Returns true if any write access is requested.
    pub fn writable(&self) -> bool {
        self.access != AccessMode::ReadOnly
    }
}

/// Where a new mount goes in the precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum MountLocation<R> {
    /// Highest precedence.
    Top,
    /// Lowest precedence.
    Bottom,
    /// Directly above the given mount.
    Above(R),
    /// Directly below the given mount.
    Below(R),
}

impl<R> MountLocation<R> {
    /// The mount this location is relative to, if any.
    pub fn relative(&self) -> Option<&R> {
        match self {
            MountLocation::Above(r) | MountLocation::Below(r) => Some(r),
            MountLocation::Top | MountLocation::Bottom => None,
        }
    }

    /// Replace the relative reference.
    pub fn map<S>(self, f: impl FnOnce(R) -> S) -> MountLocation<S> {
        match self {
            MountLocation::Top => MountLocation::Top,
            MountLocation::Bottom => MountLocation::Bottom,
            MountLocation::Above(r) => MountLocation::Above(f(r)),
            MountLocation::Below(r) => MountLocation::Below(f(r)),
        }
    }
}

/// Flags passed to a backend's mount operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountFlags {
    /// Writes through this mount are refused.
    pub read_only: bool,
    /// Directory caches of this mount are re-filled on every access.
    pub nocache: bool,
}

impl MountFlags {
    /// Read-only mount flags.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Read-write mount flags.
    pub fn read_write() -> Self {
        Self::default()
    }
}

/// Rule for mounting archives discovered beneath a mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoMount {
    /// Pattern tested against entry names.
    pub pattern: String,
    /// How `pattern` is interpreted.
    pub match_type: MatchType,
    /// Filesystem used for matching entries.
    pub fs_id: FileSystemId,
    /// Mount the entry read-only.
    #[serde(default = "default_true")]
    pub read_only: bool,
}

fn default_true() -> bool {
    true
}
