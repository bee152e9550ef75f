//! # uio
//!
//! Union-mount virtual filesystem.
//!
//! A [`Repository`] stacks directories from several physical filesystems
//! (host directories, zip archives, or custom backends) into one virtual
//! hierarchy. Mounts are ordered by precedence:
//! - Reads see the highest mount that has an entry
//! - Writes go to the highest writable mount, copying files up first
//! - Directory listings merge every layer
//!
//! ```no_run
//! use uio::{FileSystemId, MountRequest, Uio};
//!
//! let uio = Uio::init();
//! let repo = uio.open_repository();
//! repo.mount_dir("/", MountRequest::new(FileSystemId::STDIO).in_path("/usr/share/game").read_only(true))?;
//! repo.mount_dir("/", MountRequest::new(FileSystemId::STDIO).in_path("/home/me/.game"))?;
//! let top = repo.open_dir("/", false)?;
//! let mut settings = top.fopen("settings.cfg", "w")?;
//! settings.fputs("volume = 7\n")?;
//! settings.fclose()?;
//! # Ok::<(), uio::VfsError>(())
//! ```
//!
//! ## Design Decisions
//!
//! - **Backends behind one trait**: physical filesystems implement
//!   [`FileSystemHandler`] and are registered by [`FileSystemId`].
//! - **Shared physical roots**: a root lives as long as any mount or open
//!   file refers to it, so files stay readable after their mount is gone.
//! - **Synchronous API**: every operation is blocking. [`Repository`],
//!   [`DirHandle`] and [`Handle`] are `Send + Sync`, and mount table changes
//!   are serialised behind one lock. A [`Stream`] is `Send` only: it keeps
//!   its own buffer and position, so one thread uses it at a time. Clones
//!   of a `Handle` share one file position.

pub mod automount;
pub mod backends;
pub mod config;
pub mod context;
pub mod dirlist;
pub mod error;
pub mod fileblock;
pub mod fstypes;
pub mod gphys;
pub mod io;
pub mod logging;
pub mod mount_tree;
pub mod paths;
pub mod pattern;
pub mod physical;
pub mod repository;
pub mod resolve;
pub mod stream;
pub mod types;

pub use automount::{apply_auto_mounts, mount_dir_zips};
pub use backends::{StdioFs, ZipFs};
pub use config::{ConfigError, EntryLocation, MountConfig, MountEntry};
pub use context::Uio;
pub use dirlist::DirList;
pub use error::{VfsError, VfsErrorKind, VfsResult};
pub use fileblock::{FileBlock, UsageHint};
pub use fstypes::{
    Capability, EntriesIter, EntryBuffer, FileSystemHandler, FileSystemId, FileSystemRegistry,
    MountedTree, NativeFile, RootGuard,
};
pub use io::DirHandle;
pub use pattern::{MatchType, Matcher};
pub use physical::{Handle, PDirHandle, PRoot};
pub use repository::{MountHandle, MountId, MountInfo, MountRequest, Repository};
pub use stream::Stream;
pub use types::{AccessMode, AutoMount, FileAttr, FileType, MountFlags, MountLocation, OpenFlags};
