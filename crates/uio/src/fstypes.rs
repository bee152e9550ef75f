//! Filesystem handler interface and registry.
//!
//! A filesystem type is a [`FileSystemHandler`] registered under a
//! [`FileSystemId`]. The repository only talks to backends through this
//! trait; optional operations are probed with [`FileSystemHandler::supports`]
//! and reported as `NotSupported` when absent.
//!
//! ## Design Decisions
//!
//! - **Trait objects at the seam**: handlers are `Arc<dyn FileSystemHandler>`
//!   so each physical root can hold on to the handler that created it.
//! - **Busy detection by live roots**: every physical root carries a
//!   [`RootGuard`] until it is released, and a filesystem with live roots
//!   cannot be unregistered. Holding a `MountHandle` or a handler `Arc` does
//!   not keep it busy.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::{VfsError, VfsResult};
use crate::gphys::GpDir;
use crate::physical::{Handle, PDirEntryHandle, PDirHandle, PRoot};
use crate::types::{FileAttr, MountFlags, OpenFlags};

/// Identifier of a registered filesystem type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FileSystemId(pub u32);

impl FileSystemId {
    /// Host directory backend.
    pub const STDIO: FileSystemId = FileSystemId(1);
    /// Read-only zip archive backend.
    pub const ZIP: FileSystemId = FileSystemId(2);
    /// First id handed out to filesystems registered without a wanted id.
    pub const FIRST_CUSTOM: FileSystemId = FileSystemId(0x10);
}

impl std::fmt::Display for FileSystemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Optional operations a handler may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Capability {
    Stat,
    Fstat,
    Seek,
    Write,
    Mkdir,
    Rename,
    Rmdir,
    Unlink,
}

/// What a handler hands back from a successful mount.
pub struct MountedTree {
    /// Root of the cached physical directory tree.
    pub root_dir: Arc<GpDir>,
    /// Backend-private state kept alive for the lifetime of the mount.
    pub extra: Option<Arc<dyn std::any::Any + Send + Sync>>,
}

/// An open file as seen by its backend.
pub trait NativeFile: Send {
    fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize>;

    fn write(&mut self, _buf: &[u8]) -> VfsResult<usize> {
        Err(VfsError::not_supported("write"))
    }

    fn seek(&mut self, _pos: SeekFrom) -> VfsResult<u64> {
        Err(VfsError::not_supported("seek"))
    }

    fn fstat(&mut self) -> VfsResult<FileAttr> {
        Err(VfsError::not_supported("fstat"))
    }

    /// Release backend resources. Called once, when the last handle goes.
    fn close(&mut self) -> VfsResult<()> {
        Ok(())
    }
}

/// Cursor over the names in one physical directory.
pub trait EntriesIter: Send {
    /// Move as many names as fit into `buf`.
    ///
    /// Returns the number of names added. When the directory is exhausted
    /// the buffer is marked finished. Returning 0 on an unfinished buffer
    /// means the next name does not fit at all.
    fn read_entries(&mut self, buf: &mut EntryBuffer) -> VfsResult<usize>;
}

/// Size-bounded batch of directory entry names.
///
/// Each name costs one pointer-sized slot plus its bytes and a terminator,
/// so a buffer of a given capacity holds a bounded number of entries.
#[derive(Debug)]
pub struct EntryBuffer {
    capacity: usize,
    used: usize,
    names: Vec<String>,
    finished: bool,
}

impl EntryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            names: Vec::new(),
            finished: false,
        }
    }

    fn cost(name: &str) -> usize {
        std::mem::size_of::<usize>() + name.len() + 1
    }

    /// Append a name if it fits. Returns false when it does not.
    pub fn push(&mut self, name: &str) -> bool {
        let cost = Self::cost(name);
        if self.used + cost > self.capacity {
            return false;
        }
        self.used += cost;
        self.names.push(name.to_string());
        true
    }

    /// Mark the end of the directory.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Take the names collected so far and make room for the next batch.
    pub fn drain(&mut self) -> Vec<String> {
        self.used = 0;
        std::mem::take(&mut self.names)
    }
}

/// Entries iterator over a fixed list of names.
#[derive(Debug, Default)]
pub struct NameListEntries {
    names: std::vec::IntoIter<String>,
    pending: Option<String>,
}

impl NameListEntries {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names: names.into_iter(),
            pending: None,
        }
    }
}

impl EntriesIter for NameListEntries {
    fn read_entries(&mut self, buf: &mut EntryBuffer) -> VfsResult<usize> {
        let mut added = 0;
        loop {
            let Some(name) = self.pending.take().or_else(|| self.names.next()) else {
                buf.finish();
                return Ok(added);
            };
            if !buf.push(&name) {
                self.pending = Some(name);
                return Ok(added);
            }
            added += 1;
        }
    }
}

/// A filesystem type.
///
/// `dir` arguments are physical directory handles belonging to a root
/// previously produced by [`FileSystemHandler::mount`] on the same handler.
pub trait FileSystemHandler: Send + Sync {
    /// Called once on registration.
    fn init(&self) -> VfsResult<()> {
        Ok(())
    }

    /// Called once on unregistration.
    fn uninit(&self) {}

    /// Whether an optional operation is implemented.
    fn supports(&self, cap: Capability) -> bool;

    /// Mount an instance. `source` is the opened archive for filesystems
    /// that need one.
    fn mount(&self, source: Option<Handle>, flags: MountFlags) -> VfsResult<MountedTree>;

    /// Tear down a root whose last mount and last handle are gone.
    fn umount(&self, root: &PRoot) -> VfsResult<()> {
        if let Some(dir) = root.root_dir() {
            if dir.root().is_persistent() {
                dir.deep_persistent_unref();
            }
        }
        Ok(())
    }

    fn open(
        &self,
        dir: &PDirHandle,
        name: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<Box<dyn NativeFile>>;

    fn stat(&self, _dir: &PDirHandle, _name: &str) -> VfsResult<FileAttr> {
        Err(VfsError::not_supported("stat"))
    }

    fn mkdir(&self, _dir: &PDirHandle, _name: &str, _mode: u32) -> VfsResult<PDirHandle> {
        Err(VfsError::not_supported("mkdir"))
    }

    fn rename(
        &self,
        _old_dir: &PDirHandle,
        _old_name: &str,
        _new_dir: &PDirHandle,
        _new_name: &str,
    ) -> VfsResult<()> {
        Err(VfsError::not_supported("rename"))
    }

    fn rmdir(&self, _dir: &PDirHandle, _name: &str) -> VfsResult<()> {
        Err(VfsError::not_supported("rmdir"))
    }

    fn unlink(&self, _dir: &PDirHandle, _name: &str) -> VfsResult<()> {
        Err(VfsError::not_supported("unlink"))
    }

    fn open_entries(&self, dir: &PDirHandle) -> VfsResult<Box<dyn EntriesIter>> {
        Ok(Box::new(NameListEntries::new(dir.dir().entry_names())))
    }

    /// Look up a single entry. `Ok(None)` means it does not exist.
    fn get_entry(&self, dir: &PDirHandle, name: &str) -> VfsResult<Option<PDirEntryHandle>> {
        Ok(dir.lookup_cached(name))
    }
}

struct RegisteredFs {
    name: String,
    handler: Arc<dyn FileSystemHandler>,
    live_roots: Arc<AtomicUsize>,
}

/// Marks one live physical root of a registered filesystem. Dropped when
/// the root is released.
#[derive(Debug)]
pub struct RootGuard(Arc<AtomicUsize>);

impl RootGuard {
    fn new(live_roots: &Arc<AtomicUsize>) -> Self {
        live_roots.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(live_roots))
    }
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Table of registered filesystem types.
#[derive(Default)]
pub struct FileSystemRegistry {
    entries: RwLock<BTreeMap<FileSystemId, RegisteredFs>>,
}

impl std::fmt::Debug for FileSystemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemRegistry")
            .field("filesystems", &self.list())
            .finish()
    }
}

impl FileSystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    ///
    /// With `wanted == None` the first free id at or above
    /// [`FileSystemId::FIRST_CUSTOM`] is used.
    pub fn register(
        &self,
        wanted: Option<FileSystemId>,
        name: &str,
        handler: Arc<dyn FileSystemHandler>,
    ) -> VfsResult<FileSystemId> {
        let mut entries = self.entries.write();
        let id = match wanted {
            Some(id) => {
                if entries.contains_key(&id) {
                    return Err(VfsError::already_exists(format!("filesystem id {id}")));
                }
                id
            }
            None => {
                let mut id = FileSystemId::FIRST_CUSTOM;
                while entries.contains_key(&id) {
                    id = FileSystemId(id.0 + 1);
                }
                id
            }
        };

        handler.init()?;
        entries.insert(
            id,
            RegisteredFs {
                name: name.to_string(),
                handler,
                live_roots: Arc::new(AtomicUsize::new(0)),
            },
        );
        info!(fs = name, id = id.0, "registered filesystem");
        Ok(id)
    }

    /// Remove a handler once none of its physical roots is live.
    pub fn unregister(&self, id: FileSystemId) -> VfsResult<()> {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get(&id) else {
            return Err(VfsError::invalid_argument(format!("filesystem id {id} not registered")));
        };
        let live = entry.live_roots.load(Ordering::SeqCst);
        if live > 0 {
            return Err(VfsError::busy(format!(
                "filesystem '{}' has {live} mounted roots",
                entry.name
            )));
        }
        if let Some(entry) = entries.remove(&id) {
            entry.handler.uninit();
            info!(fs = %entry.name, id = id.0, "unregistered filesystem");
        }
        Ok(())
    }

    pub fn handler(&self, id: FileSystemId) -> Option<Arc<dyn FileSystemHandler>> {
        self.entries.read().get(&id).map(|e| Arc::clone(&e.handler))
    }

    /// The handler of `id` together with a guard that keeps it registered
    /// for as long as the root built from it lives.
    pub fn acquire(&self, id: FileSystemId) -> Option<(Arc<dyn FileSystemHandler>, RootGuard)> {
        self.entries
            .read()
            .get(&id)
            .map(|e| (Arc::clone(&e.handler), RootGuard::new(&e.live_roots)))
    }

    pub fn name(&self, id: FileSystemId) -> Option<String> {
        self.entries.read().get(&id).map(|e| e.name.clone())
    }

    /// Find a filesystem by name, ignoring case.
    pub fn lookup(&self, name: &str) -> Option<FileSystemId> {
        self.entries
            .read()
            .iter()
            .find(|(_, e)| e.name.eq_ignore_ascii_case(name))
            .map(|(id, _)| *id)
    }

    pub fn list(&self) -> Vec<(FileSystemId, String)> {
        self.entries
            .read()
            .iter()
            .map(|(id, e)| (*id, e.name.clone()))
            .collect()
    }
}
