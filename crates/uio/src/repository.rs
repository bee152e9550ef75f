//! Repositories and their mounts.
//!
//! A [`Repository`] is one virtual hierarchy. It owns the precedence-ordered
//! list of mounts and the [`MountTree`] that maps virtual directories onto
//! them. Each mount refers to a directory inside a physical root; several
//! mounts may share a root (see [`Repository::transplant_dir`]).
//!
//! ## Design Decisions
//!
//! - **One lock at the API boundary**: repository state sits behind a single
//!   `parking_lot::Mutex`. It is held while the mount list or tree is read
//!   or changed, never across backend I/O.
//! - **Typed placements**: relative placements carry the [`MountHandle`]
//!   they refer to, so a `Top`/`Bottom` placement with a reference mount
//!   cannot be expressed.
//! - **Drop unmounts**: a repository dropped without [`Repository::close`]
//!   still gives back its mount references, so physical roots are torn
//!   down once their last file handle closes.

use parking_lot::Mutex;
use std::io;
use std::sync::{Arc, Weak};
use tracing::{debug, info, instrument, warn};

use crate::error::{VfsError, VfsResult};
use crate::fstypes::{FileSystemId, FileSystemRegistry};
use crate::io::DirHandle;
use crate::mount_tree::{MountTree, TreeItem};
use crate::paths::{components, dos_to_unix_path, valid_path_name};
use crate::physical::{PDirHandle, PRoot};
use crate::resolve::{get_path_physical_dirs, walk_physical_path};
use crate::types::{AutoMount, MountFlags, MountLocation, OpenFlags};

/// Identifies a mount within its repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountId(pub u64);

/// One active mount.
#[derive(Debug)]
pub struct MountInfo {
    id: MountId,
    fs_id: FileSystemId,
    fs_name: String,
    flags: MountFlags,
    /// Path of `pdir` inside its physical root, without a leading `/`.
    dir_name: String,
    pdir: PDirHandle,
    /// Virtual path the mount is attached at, without a leading `/`.
    mount_point: String,
    auto_mount: Vec<AutoMount>,
}

impl MountInfo {
    pub fn id(&self) -> MountId {
        self.id
    }

    pub fn fs_id(&self) -> FileSystemId {
        self.fs_id
    }

    pub fn fs_name(&self) -> &str {
        &self.fs_name
    }

    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.read_only
    }

    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }

    /// Physical directory the mount is rooted at.
    pub fn pdir(&self) -> &PDirHandle {
        &self.pdir
    }

    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    pub fn auto_mount(&self) -> &[AutoMount] {
        &self.auto_mount
    }

    /// `fsname:/dirName`, as used in mount listings.
    pub fn label(&self) -> String {
        format!("{}:/{}", self.fs_name, self.dir_name)
    }

    /// A mount on a fresh host root that belongs to no repository.
    #[cfg(test)]
    pub(crate) fn detached(id: MountId, dir_name: String) -> Self {
        use crate::backends::StdioFs;
        use crate::fstypes::FileSystemHandler;

        let handler: Arc<dyn FileSystemHandler> = Arc::new(StdioFs::new());
        let tree = handler.mount(None, MountFlags::read_only()).unwrap();
        let root = PRoot::new(FileSystemId::STDIO, handler, MountFlags::read_only(), tree, None);
        Self {
            id,
            fs_id: FileSystemId::STDIO,
            fs_name: "stdio".to_string(),
            flags: MountFlags::read_only(),
            dir_name,
            pdir: root.root_dir_handle().unwrap(),
            mount_point: String::new(),
            auto_mount: Vec::new(),
        }
    }
}

/// Caller-side reference to a mount.
///
/// Stays valid after the mount is removed; operations on a removed mount
/// fail with `InvalidArgument`.
#[derive(Debug, Clone)]
pub struct MountHandle {
    info: Arc<MountInfo>,
    repo: Weak<RepoShared>,
}

impl MountHandle {
    pub fn id(&self) -> MountId {
        self.info.id
    }

    pub fn info(&self) -> &Arc<MountInfo> {
        &self.info
    }

    fn belongs_to(&self, repo: &Repository) -> bool {
        std::ptr::eq(self.repo.as_ptr(), Arc::as_ptr(&repo.0))
    }
}

impl PartialEq for MountHandle {
    fn eq(&self, other: &Self) -> bool {
        self.info.id == other.info.id && Weak::ptr_eq(&self.repo, &other.repo)
    }
}

impl Eq for MountHandle {}

/// Parameters of [`Repository::mount_dir`].
#[derive(Debug, Clone)]
pub struct MountRequest<'a> {
    fs_id: FileSystemId,
    source_dir: Option<&'a DirHandle>,
    source_path: Option<&'a str>,
    in_path: &'a str,
    auto_mount: Vec<AutoMount>,
    location: MountLocation<&'a MountHandle>,
    flags: MountFlags,
}

impl<'a> MountRequest<'a> {
    /// Read-write mount of `fs_id` on top of everything else.
    pub fn new(fs_id: FileSystemId) -> Self {
        Self {
            fs_id,
            source_dir: None,
            source_path: None,
            in_path: "",
            auto_mount: Vec::new(),
            location: MountLocation::Top,
            flags: MountFlags::read_write(),
        }
    }

    /// Mount the filesystem stored in the file `path` of `dir`.
    pub fn source(mut self, dir: &'a DirHandle, path: &'a str) -> Self {
        self.source_dir = Some(dir);
        self.source_path = Some(path);
        self
    }

    pub fn source_dir(mut self, dir: &'a DirHandle) -> Self {
        self.source_dir = Some(dir);
        self
    }

    pub fn source_path(mut self, path: &'a str) -> Self {
        self.source_path = Some(path);
        self
    }

    /// Directory inside the mounted filesystem to use as the mount root.
    pub fn in_path(mut self, path: &'a str) -> Self {
        self.in_path = path;
        self
    }

    pub fn auto_mount(mut self, rules: Vec<AutoMount>) -> Self {
        self.auto_mount = rules;
        self
    }

    pub fn location(mut self, location: MountLocation<&'a MountHandle>) -> Self {
        self.location = location;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.flags.read_only = read_only;
        self
    }

    pub fn nocache(mut self, nocache: bool) -> Self {
        self.flags.nocache = nocache;
        self
    }
}

#[derive(Debug)]
struct RepoState {
    /// Highest precedence first.
    mounts: Vec<Arc<MountInfo>>,
    tree: MountTree,
    next_id: u64,
}

impl RepoState {
    fn order(&self) -> Vec<MountId> {
        self.mounts.iter().map(|m| m.id).collect()
    }

    fn index_of(&self, id: MountId) -> Option<usize> {
        self.mounts.iter().position(|m| m.id == id)
    }
}

#[derive(Debug)]
struct RepoShared {
    registry: Arc<FileSystemRegistry>,
    state: Mutex<RepoState>,
}

impl Drop for RepoShared {
    fn drop(&mut self) {
        let mounts = std::mem::take(&mut self.state.get_mut().mounts);
        for mount in mounts.into_iter().rev() {
            mount.pdir.root().unref_mount();
        }
    }
}

/// A virtual hierarchy assembled from mounts.
///
/// Cloning yields another handle on the same repository.
#[derive(Debug, Clone)]
pub struct Repository(Arc<RepoShared>);

impl Repository {
    /// An empty repository using the filesystems of `registry`.
    pub fn open(registry: Arc<FileSystemRegistry>) -> Self {
        info!("opened repository");
        Self(Arc::new(RepoShared {
            registry,
            state: Mutex::new(RepoState {
                mounts: Vec::new(),
                tree: MountTree::new(),
                next_id: 1,
            }),
        }))
    }

    /// Unmount everything.
    pub fn close(self) {
        self.unmount_all();
        info!("closed repository");
    }

    pub fn registry(&self) -> &Arc<FileSystemRegistry> {
        &self.0.registry
    }

    fn handle_for(&self, info: Arc<MountInfo>) -> MountHandle {
        MountHandle {
            info,
            repo: Arc::downgrade(&self.0),
        }
    }

    /// Active mounts, highest precedence first.
    pub fn mounts(&self) -> Vec<MountHandle> {
        let state = self.0.state.lock();
        state
            .mounts
            .iter()
            .map(|m| self.handle_for(Arc::clone(m)))
            .collect()
    }

    /// Mounts in effect for the virtual path `comps` and the number of
    /// leading components the matching tree node covers.
    pub(crate) fn lookup(&self, comps: &[&str]) -> (Vec<TreeItem>, usize) {
        let state = self.0.state.lock();
        let (node, consumed) = state.tree.find(comps);
        (state.tree.items(node).to_vec(), consumed)
    }

    pub(crate) fn handle_of(&self, mount: &Arc<MountInfo>) -> MountHandle {
        self.handle_for(Arc::clone(mount))
    }

    fn check_location(&self, location: &MountLocation<&MountHandle>) -> VfsResult<()> {
        if let Some(rel) = location.relative() {
            if !rel.belongs_to(self) {
                return Err(VfsError::invalid_argument(
                    "relative mount belongs to another repository",
                ));
            }
        }
        Ok(())
    }

    /// Insert a new mount into the list and the tree.
    fn add_mount(
        &self,
        mount_point: &str,
        location: MountLocation<&MountHandle>,
        build: impl FnOnce(MountId) -> MountInfo,
    ) -> VfsResult<MountHandle> {
        let mut state = self.0.state.lock();
        let index = match location {
            MountLocation::Top => 0,
            MountLocation::Bottom => state.mounts.len(),
            MountLocation::Above(rel) => state
                .index_of(rel.id())
                .ok_or_else(|| VfsError::invalid_argument("relative mount is not mounted"))?,
            MountLocation::Below(rel) => {
                state
                    .index_of(rel.id())
                    .ok_or_else(|| VfsError::invalid_argument("relative mount is not mounted"))?
                    + 1
            }
        };

        let id = MountId(state.next_id);
        state.next_id += 1;
        let info = Arc::new(build(id));
        state.mounts.insert(index, Arc::clone(&info));
        let order = state.order();
        let comps: Vec<&str> = components(mount_point).collect();
        state.tree.add(&comps, Arc::clone(&info), &order);
        drop(state);

        debug!(mount = %info.label(), at = %mount_point, "mounted");
        Ok(self.handle_for(info))
    }

    /// Mount a filesystem at `mount_point`.
    #[instrument(skip(self, req), fields(fs = %req.fs_id))]
    pub fn mount_dir(&self, mount_point: &str, req: MountRequest<'_>) -> VfsResult<MountHandle> {
        let mount_point = mount_point.strip_prefix('/').unwrap_or(mount_point);
        if !valid_path_name(mount_point) {
            return Err(VfsError::invalid_argument(format!(
                "invalid mount point '{mount_point}'"
            )));
        }
        let (source_dir, source_path) = match (req.source_dir, req.source_path) {
            (Some(dir), Some(path)) => (Some(dir), path),
            (None, None) => (None, ""),
            _ => {
                return Err(VfsError::invalid_argument(
                    "source directory and source path go together",
                ));
            }
        };
        self.check_location(&req.location)?;

        let (handler, guard) = self
            .0
            .registry
            .acquire(req.fs_id)
            .ok_or_else(|| VfsError::no_device(req.fs_id.to_string()))?;
        let fs_name = self
            .0
            .registry
            .name(req.fs_id)
            .unwrap_or_else(|| req.fs_id.to_string());

        let source = match source_dir {
            Some(dir) => {
                let flags = if req.flags.read_only {
                    OpenFlags::read()
                } else {
                    OpenFlags::read_write()
                };
                Some(dir.open(source_path, flags, 0)?)
            }
            None => None,
        };

        let tree = handler.mount(source, req.flags)?;
        let root = PRoot::new(req.fs_id, handler, req.flags, tree, Some(guard));

        let in_path = if cfg!(windows) {
            dos_to_unix_path(req.in_path)
        } else {
            req.in_path.to_string()
        };
        let in_comps: Vec<&str> = components(&in_path).collect();
        let pdir = match root
            .root_dir_handle()
            .and_then(|top| walk_physical_path(&top, &in_comps))
        {
            Ok(walk) if walk.matched == in_comps.len() => walk.dir,
            Ok(_) => {
                root.unref_mount();
                return Err(VfsError::not_found(format!("'{in_path}' in mounted filesystem")));
            }
            Err(e) => {
                root.unref_mount();
                return Err(e);
            }
        };
        let dir_name = in_comps.join("/");

        let result = self.add_mount(mount_point, req.location, |id| MountInfo {
            id,
            fs_id: req.fs_id,
            fs_name,
            flags: req.flags,
            dir_name,
            pdir,
            mount_point: mount_point.to_string(),
            auto_mount: req.auto_mount,
        });
        if result.is_err() {
            root.unref_mount();
        }
        result
    }

    /// Mount the directory `source` of a repository at `mount_point`.
    ///
    /// The first read-only physical location of `source` is used. Only
    /// read-only transplants are supported.
    pub fn transplant_dir(
        &self,
        mount_point: &str,
        source: &DirHandle,
        read_only: bool,
        location: MountLocation<&MountHandle>,
    ) -> VfsResult<MountHandle> {
        if !read_only {
            return Err(VfsError::not_supported("read-write transplant"));
        }
        let mount_point = mount_point.strip_prefix('/').unwrap_or(mount_point);
        if !valid_path_name(mount_point) {
            return Err(VfsError::invalid_argument(format!(
                "invalid mount point '{mount_point}'"
            )));
        }
        self.check_location(&location)?;

        let dirs = get_path_physical_dirs(source, "")?;
        let Some(found) = dirs.into_iter().find(|d| d.mount.is_read_only()) else {
            return Err(VfsError::not_found("no read-only location to transplant"));
        };

        let root = Arc::clone(found.pdir.root());
        root.ref_mount();
        let flags = MountFlags {
            read_only: true,
            ..found.mount.flags
        };
        let result = self.add_mount(mount_point, location, |id| MountInfo {
            id,
            fs_id: found.mount.fs_id,
            fs_name: found.mount.fs_name.clone(),
            flags,
            dir_name: String::new(),
            pdir: found.pdir,
            mount_point: mount_point.to_string(),
            auto_mount: found.mount.auto_mount.clone(),
        });
        if result.is_err() {
            root.unref_mount();
        }
        result
    }

    /// Remove a mount.
    ///
    /// Files opened through the mount stay usable; the physical root is
    /// released when the last of them is closed.
    #[instrument(skip(self, mount), fields(mount = %mount.info.label()))]
    pub fn unmount_dir(&self, mount: &MountHandle) -> VfsResult<()> {
        if !mount.belongs_to(self) {
            return Err(VfsError::invalid_argument("mount belongs to another repository"));
        }
        let info = {
            let mut state = self.0.state.lock();
            let index = state
                .index_of(mount.id())
                .ok_or_else(|| VfsError::invalid_argument("mount is not mounted"))?;
            state.tree.remove(mount.id());
            state.mounts.remove(index)
        };

        let root = info.pdir.root();
        if root.mount_refs() == 1 && root.handle_refs() > 0 {
            warn!(
                mount = %info.label(),
                open_handles = root.handle_refs(),
                "unmounting while files are still open"
            );
        }
        root.unref_mount();
        debug!(mount = %info.label(), "unmounted");
        Ok(())
    }

    /// Remove every mount, lowest precedence first.
    pub fn unmount_all(&self) {
        loop {
            let last = {
                let state = self.0.state.lock();
                state.mounts.last().map(|m| self.handle_for(Arc::clone(m)))
            };
            let Some(mount) = last else {
                break;
            };
            if let Err(e) = self.unmount_dir(&mount) {
                warn!(error = %e, "unmount failed");
                break;
            }
        }
    }

    /// One line per mount: `fsname:/dirName on /path type fsname (ro|rw)`.
    pub fn print_mounts<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        let mounts: Vec<Arc<MountInfo>> = self.0.state.lock().mounts.clone();
        for m in mounts {
            writeln!(
                out,
                "{} on /{} type {} ({})",
                m.label(),
                m.mount_point,
                m.fs_name,
                if m.is_read_only() { "ro" } else { "rw" }
            )?;
        }
        Ok(())
    }

    /// Indented dump of the mount tree.
    pub fn print_mount_tree<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        let dump = self.0.state.lock().tree.render(&|m: &MountInfo| m.label());
        out.write_all(dump.as_bytes())
    }

    #[cfg(test)]
    pub(crate) fn tree_node_count(&self) -> usize {
        self.0.state.lock().tree.node_count()
    }
}
