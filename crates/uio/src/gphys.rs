//! Generic physical directory cache.
//!
//! Backends that do not want to manage their own directory bookkeeping keep
//! a tree of [`GpDir`] nodes per mounted root. A node is either filled
//! eagerly at mount time (zip archives) or populated on demand through
//! [`GpRootOps::fill_dir`] and lookups that consult the backing store (host
//! directories).
//!
//! ## Design Decisions
//!
//! - **Persistent vs cached children**: under a persistent root a committed
//!   subdirectory is owned by its parent. Otherwise the parent only keeps a
//!   weak link and the node disappears once no handle refers to it; the
//!   parent is then no longer complete.
//! - **No lock across fills**: the state lock is released before calling
//!   into the backend so `fill_dir` may add entries.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::warn;

use crate::error::VfsResult;

/// Backend hooks for on-demand population.
pub trait GpRootOps: Send + Sync {
    /// Add the entries of `dir` from the backing store.
    fn fill_dir(&self, dir: &Arc<GpDir>) -> VfsResult<()>;
}

/// Per-mount settings shared by every node of one tree.
pub struct GpRoot {
    persistent: bool,
    nocache: bool,
    ops: Option<Arc<dyn GpRootOps>>,
}

impl std::fmt::Debug for GpRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpRoot")
            .field("persistent", &self.persistent)
            .field("nocache", &self.nocache)
            .finish()
    }
}

impl GpRoot {
    pub fn new(ops: Option<Arc<dyn GpRootOps>>, persistent: bool, nocache: bool) -> Arc<Self> {
        Arc::new(Self {
            persistent,
            nocache,
            ops,
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Create the top directory of the tree.
    pub fn make_root_dir(self: &Arc<Self>, complete: bool) -> Arc<GpDir> {
        let dir = GpDir::new(self, false);
        dir.state.lock().complete = complete;
        dir
    }
}

type Extra = Arc<dyn Any + Send + Sync>;

/// A cached file entry.
#[derive(Default)]
pub struct GpFile {
    extra: Option<Extra>,
}

impl std::fmt::Debug for GpFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpFile").finish_non_exhaustive()
    }
}

impl GpFile {
    pub fn new(extra: Option<Extra>) -> Arc<Self> {
        Arc::new(Self { extra })
    }

    /// Backend data attached to this file.
    pub fn extra<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.extra.clone().and_then(|e| e.downcast::<T>().ok())
    }
}

enum Slot {
    Owned(Arc<GpDir>),
    Cached(Weak<GpDir>),
    File(Arc<GpFile>),
}

/// An entry found in a [`GpDir`].
#[derive(Debug, Clone)]
pub enum GpEntry {
    Dir(Arc<GpDir>),
    File(Arc<GpFile>),
}

struct DirState {
    complete: bool,
    detached: bool,
    entries: BTreeMap<String, Slot>,
    extra: Option<Extra>,
}

/// A cached directory node.
pub struct GpDir {
    root: Arc<GpRoot>,
    state: Mutex<DirState>,
}

impl std::fmt::Debug for GpDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("GpDir")
            .field("complete", &state.complete)
            .field("entries", &state.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl GpDir {
    fn new(root: &Arc<GpRoot>, detached: bool) -> Arc<Self> {
        Arc::new(Self {
            root: Arc::clone(root),
            state: Mutex::new(DirState {
                complete: false,
                detached,
                entries: BTreeMap::new(),
                extra: None,
            }),
        })
    }

    pub fn root(&self) -> &Arc<GpRoot> {
        &self.root
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    pub fn set_complete(&self, complete: bool) {
        self.state.lock().complete = complete;
    }

    pub fn extra<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.state
            .lock()
            .extra
            .clone()
            .and_then(|e| e.downcast::<T>().ok())
    }

    pub fn set_extra(&self, extra: Extra) {
        self.state.lock().extra = Some(extra);
    }

    /// Get the subdirectory `name`, or a new detached node to be passed to
    /// [`GpDir::commit_sub_dir`].
    pub fn prepare_sub_dir(&self, name: &str) -> Arc<GpDir> {
        let state = self.state.lock();
        match state.entries.get(name) {
            Some(Slot::Owned(dir)) => return Arc::clone(dir),
            Some(Slot::Cached(weak)) => {
                if let Some(dir) = weak.upgrade() {
                    return dir;
                }
            }
            Some(Slot::File(_)) => {
                warn!(name, "directory shadows file with the same name from the same filesystem");
            }
            None => {}
        }
        GpDir::new(&self.root, true)
    }

    /// Link a node obtained from [`GpDir::prepare_sub_dir`] into this one.
    /// Nodes that were already linked are left alone.
    pub fn commit_sub_dir(&self, name: &str, sub: &Arc<GpDir>) {
        {
            let mut sub_state = sub.state.lock();
            if !sub_state.detached {
                return;
            }
            sub_state.detached = false;
        }
        let slot = if self.root.persistent {
            Slot::Owned(Arc::clone(sub))
        } else {
            Slot::Cached(Arc::downgrade(sub))
        };
        self.state.lock().entries.insert(name.to_string(), slot);
    }

    pub fn add_file(&self, name: &str, file: Arc<GpFile>) {
        self.state
            .lock()
            .entries
            .insert(name.to_string(), Slot::File(file));
    }

    pub fn remove_file(&self, name: &str) {
        let mut state = self.state.lock();
        if matches!(state.entries.get(name), Some(Slot::File(_))) {
            state.entries.remove(name);
        }
    }

    pub fn remove_sub_dir(&self, name: &str) {
        let mut state = self.state.lock();
        if matches!(
            state.entries.get(name),
            Some(Slot::Owned(_) | Slot::Cached(_))
        ) {
            state.entries.remove(name);
        }
    }

    /// Move the cache entry `old` of this directory to `new` in `target`.
    pub fn move_entry(&self, old: &str, target: &GpDir, new: &str) {
        let slot = self.state.lock().entries.remove(old);
        if let Some(slot) = slot {
            target.state.lock().entries.insert(new.to_string(), slot);
        }
    }

    /// Make sure the entries are loaded.
    pub fn access(self: &Arc<Self>) {
        let needs_fill = {
            let state = self.state.lock();
            !state.complete || self.root.nocache
        };
        if !needs_fill {
            return;
        }
        let Some(ops) = self.root.ops.clone() else {
            return;
        };
        match ops.fill_dir(self) {
            Ok(()) => self.set_complete(true),
            Err(e) => warn!(error = %e, "failed to fill directory cache"),
        }
    }

    /// Look up a cached entry, filling the directory first if needed.
    pub fn get_entry(self: &Arc<Self>, name: &str) -> Option<GpEntry> {
        self.access();
        let mut state = self.state.lock();
        let entry = match state.entries.get(name)? {
            Slot::Owned(dir) => Some(GpEntry::Dir(Arc::clone(dir))),
            Slot::Cached(weak) => weak.upgrade().map(GpEntry::Dir),
            Slot::File(file) => Some(GpEntry::File(Arc::clone(file))),
        };
        if entry.is_none() {
            state.entries.remove(name);
            state.complete = false;
        }
        entry
    }

    /// Names of all live entries, sorted.
    pub fn entry_names(self: &Arc<Self>) -> Vec<String> {
        self.access();
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|(_, slot)| match slot {
                Slot::Cached(weak) => weak.strong_count() > 0,
                _ => true,
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Live subdirectory nodes currently in the cache, with their names.
    pub fn cached_sub_dirs(&self) -> Vec<(String, Arc<GpDir>)> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter_map(|(name, slot)| match slot {
                Slot::Owned(dir) => Some((name.clone(), Arc::clone(dir))),
                Slot::Cached(weak) => weak.upgrade().map(|d| (name.clone(), d)),
                Slot::File(_) => None,
            })
            .collect()
    }

    /// Drop every owned node below this one. Nodes that survive through
    /// outstanding handles are left incomplete so they get refilled.
    pub fn deep_persistent_unref(&self) {
        let entries = {
            let mut state = self.state.lock();
            state.complete = false;
            std::mem::take(&mut state.entries)
        };
        for slot in entries.into_values() {
            match slot {
                Slot::Owned(dir) => dir.deep_persistent_unref(),
                Slot::Cached(weak) => {
                    if let Some(dir) = weak.upgrade() {
                        dir.set_complete(false);
                    }
                }
                Slot::File(_) => {}
            }
        }
    }
}
