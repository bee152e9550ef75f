//! Mapping virtual paths onto physical locations.
//!
//! A virtual path is first made absolute against a [`DirHandle`]. The mount
//! tree then yields the mounts in effect there, each of which is walked
//! physically. [`get_physical_access`] picks the locations to read from and
//! write to; [`get_path_physical_dirs`] collects every physical directory
//! that contributes to a virtual directory.

use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::error::{VfsError, VfsResult};
use crate::fstypes::Capability;
use crate::io::DirHandle;
use crate::mount_tree::TreeItem;
use crate::paths::join_paths_absolute;
use crate::physical::{Handle, PDirEntryHandle, PDirHandle};
use crate::repository::MountInfo;
use crate::types::OpenFlags;

const COPY_BUFFER_SIZE: usize = 0x10000;

/// How far a physical walk got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStatus {
    /// Every component was a directory.
    Complete,
    /// The component at `matched` does not exist.
    NotFound,
    /// The component at `matched` exists but is not a directory.
    NotADirectory,
}

/// Result of [`walk_physical_path`].
#[derive(Debug, Clone)]
pub struct Walk {
    /// Deepest directory reached.
    pub dir: PDirHandle,
    /// Number of components walked into.
    pub matched: usize,
    pub status: WalkStatus,
}

/// Follow `comps` from `start` as far as they name directories.
pub fn walk_physical_path(start: &PDirHandle, comps: &[&str]) -> VfsResult<Walk> {
    let mut dir = start.clone();
    for (i, comp) in comps.iter().enumerate() {
        match dir.get_entry(comp)? {
            None => {
                return Ok(Walk {
                    dir,
                    matched: i,
                    status: WalkStatus::NotFound,
                });
            }
            Some(PDirEntryHandle::File(_)) => {
                return Ok(Walk {
                    dir,
                    matched: i,
                    status: WalkStatus::NotADirectory,
                });
            }
            Some(PDirEntryHandle::Dir(sub)) => dir = sub,
        }
    }
    Ok(Walk {
        dir,
        matched: comps.len(),
        status: WalkStatus::Complete,
    })
}

/// Create `comps` below `start`, parents included, and return the last
/// directory. Directories created before a failure are left in place.
pub fn make_path(start: &PDirHandle, comps: &[&str], mode: u32) -> VfsResult<PDirHandle> {
    if !start.root().supports(Capability::Mkdir) {
        return Err(VfsError::not_supported("mkdir"));
    }
    let walk = walk_physical_path(start, comps)?;
    let mut dir = walk.dir;
    for comp in &comps[walk.matched..] {
        dir = dir.handler().mkdir(&dir, comp, mode)?;
    }
    Ok(dir)
}

fn open_physical(dir: &PDirHandle, name: &str, flags: OpenFlags, mode: u32) -> VfsResult<Handle> {
    let native = dir.handler().open(dir, name, flags, mode)?;
    Ok(Handle::new(Arc::clone(dir.root()), native, flags))
}

/// Copy a file between physical directories, keeping its permission bits.
///
/// Fails with `AlreadyExists` if the target exists. A partial copy is
/// removed again.
pub fn copy_file_physical(
    from_dir: &PDirHandle,
    from_name: &str,
    to_dir: &PDirHandle,
    to_name: &str,
) -> VfsResult<()> {
    let to_root = to_dir.root();
    if !to_root.supports(Capability::Write)
        || !from_dir.root().supports(Capability::Fstat)
        || !to_root.supports(Capability::Unlink)
    {
        return Err(VfsError::not_supported("copy between physical roots"));
    }

    let from = open_physical(from_dir, from_name, OpenFlags::read(), 0)?;
    let perm = from.fstat()?.perm & 0o777;
    let to = open_physical(to_dir, to_name, OpenFlags::create_exclusive(), perm)?;

    let copied = copy_contents(&from, &to);
    drop(from);
    match copied {
        Ok(()) => to.close(),
        Err(e) => {
            drop(to);
            warn!(file = to_name, error = %e, "copy failed, removing partial file");
            if let Err(unlink_err) = to_dir.handler().unlink(to_dir, to_name) {
                debug!(error = %unlink_err, "removing partial copy failed");
            }
            Err(e)
        }
    }
}

fn copy_contents(from: &Handle, to: &Handle) -> VfsResult<()> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match from.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(VfsError::Io(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let mut pending = &buf[..n];
        while !pending.is_empty() {
            match to.write(pending) {
                Ok(0) => return Err(VfsError::corrupt("write made no progress")),
                Ok(written) => pending = &pending[written..],
                Err(VfsError::Io(e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// Absolute virtual path of `path` relative to `dir`, as components.
///
/// `.` components are dropped and `..` removes the previous component.
/// Going above the directory's root boundary is `NotFound`.
pub fn resolve_path(dir: &DirHandle, path: &str) -> VfsResult<Vec<String>> {
    let root_end = dir.root_end();
    let mut out: Vec<String> = dir.comps()[..root_end].to_vec();
    if !path.starts_with('/') {
        out.extend_from_slice(&dir.comps()[root_end..]);
    }
    for comp in path.split('/').filter(|c| !c.is_empty()) {
        match comp {
            "." => {}
            ".." => {
                if out.len() <= root_end {
                    return Err(VfsError::not_found(format!("'{path}' leaves the root")));
                }
                out.pop();
            }
            _ => out.push(comp.to_string()),
        }
    }
    Ok(out)
}

/// Mounts in effect for `full` and, per mount, the path below its root.
fn items_for<'a>(dir: &DirHandle, full: &'a [String]) -> Vec<(TreeItem, Vec<&'a str>)> {
    let comps: Vec<&str> = full.iter().map(String::as_str).collect();
    let (items, consumed) = dir.repository().lookup(&comps);
    items
        .into_iter()
        .map(|item| {
            let start = consumed.saturating_sub(item.depth);
            let rest = comps[start..].to_vec();
            (item, rest)
        })
        .collect()
}

/// Resolve `path` and check it names an existing directory.
pub fn verify_path(dir: &DirHandle, path: &str) -> VfsResult<Vec<String>> {
    let full = resolve_path(dir, path)?;
    let comps: Vec<&str> = full.iter().map(String::as_str).collect();
    let (_, consumed) = dir.repository().lookup(&comps);
    if consumed == comps.len() {
        return Ok(full);
    }

    for (item, rest) in items_for(dir, &full) {
        match walk_physical_path(item.mount.pdir(), &rest)?.status {
            WalkStatus::Complete => return Ok(full),
            WalkStatus::NotADirectory => return Err(VfsError::not_a_directory(path)),
            WalkStatus::NotFound => {}
        }
    }
    Err(VfsError::not_found(path))
}

/// A physical directory and the mount it was reached through.
#[derive(Debug, Clone)]
pub struct PhysicalDir {
    pub pdir: PDirHandle,
    pub mount: Arc<MountInfo>,
}

/// Every existing physical directory behind the virtual directory `path`,
/// highest precedence first.
///
/// A location where a component is a file hides all lower ones.
pub fn get_path_physical_dirs(dir: &DirHandle, path: &str) -> VfsResult<Vec<PhysicalDir>> {
    let full = resolve_path(dir, path)?;
    let mut dirs = Vec::new();
    for (item, rest) in items_for(dir, &full) {
        let walk = walk_physical_path(item.mount.pdir(), &rest)?;
        match walk.status {
            WalkStatus::Complete => dirs.push(PhysicalDir {
                pdir: walk.dir,
                mount: item.mount,
            }),
            WalkStatus::NotFound => {}
            WalkStatus::NotADirectory => break,
        }
    }
    Ok(dirs)
}

/// One physical place a virtual path maps to.
#[derive(Debug, Clone)]
pub struct Location {
    pub mount: Arc<MountInfo>,
    /// Directory holding the entry.
    pub dir: PDirHandle,
    /// Path of the entry from the top of the physical root.
    pub proot_path: String,
}

/// Where to read and write a virtual path.
#[derive(Debug, Clone)]
pub struct PhysicalAccess {
    pub read: Location,
    /// Only set when write access was requested.
    pub write: Option<Location>,
    /// Last component of the path.
    pub name: String,
    /// Whether the entry exists in the read location.
    pub exists: bool,
    same: bool,
}

impl PhysicalAccess {
    /// Whether reading and writing use the same physical directory.
    pub fn same_location(&self) -> bool {
        self.same
    }
}

/// Find the read and, for writable `flags`, the write location of `path`.
///
/// The read location is the highest mount in which the entry exists. If
/// none has it but writing is requested, the highest mount in which the
/// parent exists is used and the entry will be created. The write location
/// is the highest writable mount; missing parent directories are created
/// there unless `no_write` is set.
#[instrument(skip(dir, flags), fields(dir = %dir.path()))]
pub fn get_physical_access(
    dir: &DirHandle,
    path: &str,
    flags: OpenFlags,
    no_write: bool,
) -> VfsResult<PhysicalAccess> {
    let full = resolve_path(dir, path)?;
    let items = items_for(dir, &full);

    let mut read: Option<(usize, PDirHandle, String)> = None;
    let mut write_index: Option<usize> = None;
    let mut exists = false;

    for (i, (item, rest)) in items.iter().enumerate() {
        let walk = walk_physical_path(item.mount.pdir(), rest)?;
        if walk.status == WalkStatus::Complete {
            return Err(VfsError::is_a_directory(path));
        }
        if write_index.is_none() && !item.mount.is_read_only() {
            write_index = Some(i);
        }

        let remaining = &rest[walk.matched..];
        if remaining.len() == 1 {
            let name = remaining[0];
            if walk.dir.get_entry(name)?.is_some() {
                read = Some((i, walk.dir, name.to_string()));
                exists = true;
                break;
            }
            if flags.writable() && read.is_none() {
                read = Some((i, walk.dir, name.to_string()));
            }
        } else if walk.status == WalkStatus::NotADirectory {
            return Err(VfsError::not_a_directory(path));
        }
    }

    let Some((read_index, read_dir, name)) = read else {
        return Err(VfsError::not_found(path));
    };
    let read_item = &items[read_index];
    let read_loc = Location {
        mount: Arc::clone(&read_item.0.mount),
        dir: read_dir,
        proot_path: join_paths_absolute(read_item.0.mount.dir_name(), &read_item.1.join("/")),
    };

    if !flags.writable() {
        return Ok(PhysicalAccess {
            read: read_loc,
            write: None,
            name,
            exists,
            same: false,
        });
    }

    if exists && flags.create && flags.exclusive {
        return Err(VfsError::already_exists(path));
    }
    if !exists && !flags.create {
        return Err(VfsError::not_found(path));
    }

    let w = match write_index {
        None => return Err(VfsError::permission_denied(path)),
        Some(w) if w == read_index => {
            let write = read_loc.clone();
            return Ok(PhysicalAccess {
                read: read_loc,
                write: Some(write),
                name,
                exists,
                same: true,
            });
        }
        Some(w) => w,
    };

    let (write_item, write_rest) = &items[w];
    let parents = &write_rest[..write_rest.len().saturating_sub(1)];
    let write_dir = if parents.is_empty() {
        write_item.mount.pdir().clone()
    } else {
        if no_write {
            return Err(VfsError::not_found(path));
        }
        make_path(write_item.mount.pdir(), parents, 0o777).map_err(|e| match e {
            VfsError::NotSupported(_) => {
                VfsError::corrupt(format!("cannot create directories for '{path}'"))
            }
            other => other,
        })?
    };
    let write_loc = Location {
        mount: Arc::clone(&write_item.mount),
        dir: write_dir,
        proot_path: join_paths_absolute(write_item.mount.dir_name(), &write_rest.join("/")),
    };

    let read_loc = if exists {
        read_loc
    } else {
        write_loc.clone()
    };
    debug!(
        read = %read_loc.proot_path,
        write = %write_loc.proot_path,
        "write location differs from read location"
    );
    Ok(PhysicalAccess {
        same: !exists,
        read: read_loc,
        write: Some(write_loc),
        name,
        exists,
    })
}
