//! Physical roots and handles.
//!
//! A [`PRoot`] is one mounted instance of a filesystem. It is shared by
//! every mount that refers to it (a transplant reuses the root of the mount
//! it copies) and by every open file inside it. The two kinds of reference
//! are counted separately: the backend is only unmounted when both reach
//! zero, so closing the repository while files are still open is safe.

use parking_lot::Mutex;
use std::any::Any;
use std::io::SeekFrom;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{VfsError, VfsResult};
use crate::fstypes::{
    Capability, FileSystemHandler, FileSystemId, MountedTree, NativeFile, RootGuard,
};
use crate::gphys::{GpDir, GpEntry, GpFile};
use crate::types::{FileAttr, MountFlags, OpenFlags};

#[derive(Debug, Default)]
struct RefCounts {
    mount: usize,
    handle: usize,
}

/// One mounted instance of a filesystem.
pub struct PRoot {
    fs_id: FileSystemId,
    handler: Arc<dyn FileSystemHandler>,
    flags: MountFlags,
    root_dir: Mutex<Option<Arc<GpDir>>>,
    extra: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    refs: Mutex<RefCounts>,
    guard: Mutex<Option<RootGuard>>,
}

impl std::fmt::Debug for PRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let refs = self.refs.lock();
        f.debug_struct("PRoot")
            .field("fs_id", &self.fs_id)
            .field("flags", &self.flags)
            .field("mount_refs", &refs.mount)
            .field("handle_refs", &refs.handle)
            .finish()
    }
}

impl PRoot {
    /// Wrap a freshly mounted tree. The caller holds the first mount
    /// reference. `guard` is dropped when the root is released.
    pub fn new(
        fs_id: FileSystemId,
        handler: Arc<dyn FileSystemHandler>,
        flags: MountFlags,
        tree: MountedTree,
        guard: Option<RootGuard>,
    ) -> Arc<Self> {
        Arc::new(Self {
            fs_id,
            handler,
            flags,
            root_dir: Mutex::new(Some(tree.root_dir)),
            extra: Mutex::new(tree.extra),
            refs: Mutex::new(RefCounts {
                mount: 1,
                handle: 0,
            }),
            guard: Mutex::new(guard),
        })
    }

    pub fn fs_id(&self) -> FileSystemId {
        self.fs_id
    }

    pub fn handler(&self) -> &Arc<dyn FileSystemHandler> {
        &self.handler
    }

    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.read_only
    }

    pub fn supports(&self, cap: Capability) -> bool {
        self.handler.supports(cap)
    }

    /// Backend state attached at mount time.
    pub fn extra<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.extra.lock().clone().and_then(|e| e.downcast::<T>().ok())
    }

    /// The top directory, or `None` once the root has been released.
    pub fn root_dir(&self) -> Option<Arc<GpDir>> {
        self.root_dir.lock().clone()
    }

    pub fn root_dir_handle(self: &Arc<Self>) -> VfsResult<PDirHandle> {
        let dir = self
            .root_dir()
            .ok_or_else(|| VfsError::not_found("physical root already released"))?;
        Ok(PDirHandle::new(Arc::clone(self), dir))
    }

    pub fn mount_refs(&self) -> usize {
        self.refs.lock().mount
    }

    pub fn handle_refs(&self) -> usize {
        self.refs.lock().handle
    }

    pub fn ref_mount(&self) {
        self.refs.lock().mount += 1;
    }

    pub fn unref_mount(&self) {
        let release = {
            let mut refs = self.refs.lock();
            refs.mount = refs.mount.saturating_sub(1);
            refs.mount == 0 && refs.handle == 0
        };
        if release {
            self.release();
        }
    }

    pub fn ref_handle(&self) {
        self.refs.lock().handle += 1;
    }

    pub fn unref_handle(&self) {
        let release = {
            let mut refs = self.refs.lock();
            refs.handle = refs.handle.saturating_sub(1);
            refs.mount == 0 && refs.handle == 0
        };
        if release {
            self.release();
        }
    }

    fn release(&self) {
        debug!(fs_id = self.fs_id.0, "releasing physical root");
        if let Err(e) = self.handler.umount(self) {
            warn!(fs_id = self.fs_id.0, error = %e, "unmounting physical root failed");
        }
        self.root_dir.lock().take();
        self.extra.lock().take();
        self.guard.lock().take();
    }
}

/// A directory inside a physical root.
#[derive(Debug, Clone)]
pub struct PDirHandle {
    root: Arc<PRoot>,
    dir: Arc<GpDir>,
}

impl PDirHandle {
    pub fn new(root: Arc<PRoot>, dir: Arc<GpDir>) -> Self {
        Self { root, dir }
    }

    pub fn root(&self) -> &Arc<PRoot> {
        &self.root
    }

    pub fn dir(&self) -> &Arc<GpDir> {
        &self.dir
    }

    pub fn handler(&self) -> &Arc<dyn FileSystemHandler> {
        self.root.handler()
    }

    /// Look up `name` through the backend.
    pub fn get_entry(&self, name: &str) -> VfsResult<Option<PDirEntryHandle>> {
        self.root.handler().get_entry(self, name)
    }

    /// Look up `name` in the cache only.
    pub fn lookup_cached(&self, name: &str) -> Option<PDirEntryHandle> {
        self.dir.get_entry(name).map(|entry| match entry {
            GpEntry::Dir(dir) => PDirEntryHandle::Dir(PDirHandle::new(Arc::clone(&self.root), dir)),
            GpEntry::File(file) => {
                PDirEntryHandle::File(PFileHandle::new(Arc::clone(&self.root), file))
            }
        })
    }

    /// Whether two handles name the same physical directory.
    pub fn same_dir(&self, other: &PDirHandle) -> bool {
        Arc::ptr_eq(&self.dir, &other.dir)
    }
}

/// A file inside a physical root.
#[derive(Debug, Clone)]
pub struct PFileHandle {
    root: Arc<PRoot>,
    file: Arc<GpFile>,
}

impl PFileHandle {
    pub fn new(root: Arc<PRoot>, file: Arc<GpFile>) -> Self {
        Self { root, file }
    }

    pub fn root(&self) -> &Arc<PRoot> {
        &self.root
    }

    pub fn file(&self) -> &Arc<GpFile> {
        &self.file
    }
}

/// Result of a directory lookup.
#[derive(Debug, Clone)]
pub enum PDirEntryHandle {
    Dir(PDirHandle),
    File(PFileHandle),
}

impl PDirEntryHandle {
    pub fn is_dir(&self) -> bool {
        matches!(self, PDirEntryHandle::Dir(_))
    }
}

struct HandleInner {
    root: Arc<PRoot>,
    native: Mutex<Option<Box<dyn NativeFile>>>,
    flags: OpenFlags,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let Some(mut native) = self.native.get_mut().take() {
            if let Err(e) = native.close() {
                warn!(error = %e, "closing file failed");
            }
        }
        self.root.unref_handle();
    }
}

/// An open file.
///
/// Clones share the same underlying file; the backend file is closed when
/// the last clone goes away.
#[derive(Clone)]
pub struct Handle(Arc<HandleInner>);

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("fs_id", &self.0.root.fs_id())
            .field("flags", &self.0.flags)
            .finish()
    }
}

impl Handle {
    pub fn new(root: Arc<PRoot>, native: Box<dyn NativeFile>, flags: OpenFlags) -> Self {
        root.ref_handle();
        Self(Arc::new(HandleInner {
            root,
            native: Mutex::new(Some(native)),
            flags,
        }))
    }

    pub fn root(&self) -> &Arc<PRoot> {
        &self.0.root
    }

    pub fn flags(&self) -> OpenFlags {
        self.0.flags
    }

    fn with_native<T>(
        &self,
        f: impl FnOnce(&mut dyn NativeFile) -> VfsResult<T>,
    ) -> VfsResult<T> {
        let mut native = self.0.native.lock();
        match native.as_mut() {
            Some(file) => f(file.as_mut()),
            None => Err(VfsError::invalid_argument("handle already closed")),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> VfsResult<usize> {
        self.with_native(|f| f.read(buf))
    }

    pub fn write(&self, buf: &[u8]) -> VfsResult<usize> {
        if !self.0.root.supports(Capability::Write) {
            return Err(VfsError::not_supported("write"));
        }
        self.with_native(|f| f.write(buf))
    }

    pub fn lseek(&self, pos: SeekFrom) -> VfsResult<u64> {
        if !self.0.root.supports(Capability::Seek) {
            return Err(VfsError::not_supported("seek"));
        }
        self.with_native(|f| f.seek(pos))
    }

    pub fn fstat(&self) -> VfsResult<FileAttr> {
        if !self.0.root.supports(Capability::Fstat) {
            return Err(VfsError::not_supported("fstat"));
        }
        self.with_native(|f| f.fstat())
    }

    /// Close this reference. The backend close error is reported when this
    /// was the last one.
    pub fn close(self) -> VfsResult<()> {
        if Arc::strong_count(&self.0) == 1 {
            let native = self.0.native.lock().take();
            if let Some(mut native) = native {
                native.close()?;
            }
        }
        Ok(())
    }
}
