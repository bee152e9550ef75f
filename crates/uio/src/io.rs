//! Logical file operations.
//!
//! Everything a caller does to the virtual hierarchy goes through a
//! [`DirHandle`]: paths are relative to it unless they start with `/`, and
//! `..` never climbs above its root boundary.
//!
//! ## Design Decisions
//!
//! - **Copy-on-write**: opening a file for writing when it only exists in
//!   a lower layer copies it into the highest writable layer first. Lower
//!   layers are never written through.
//! - **Deletes hit every writable layer**: `unlink` and `rmdir` remove the
//!   entry from all writable locations that have it.

use std::sync::Arc;
use tracing::debug;

use crate::error::{VfsError, VfsResult};
use crate::fstypes::Capability;
use crate::paths::split_last;
use crate::physical::Handle;
use crate::repository::{MountHandle, Repository};
use crate::resolve::{
    copy_file_physical, get_path_physical_dirs, get_physical_access, verify_path, Location,
};
use crate::types::{FileAttr, OpenFlags};

/// An open virtual directory.
#[derive(Debug, Clone)]
pub struct DirHandle {
    repo: Repository,
    comps: Vec<String>,
    /// `..` never removes components before this index.
    root_end: usize,
}

impl Repository {
    /// Open the virtual directory `path`.
    ///
    /// With `as_root` the directory becomes the root for paths resolved
    /// through the handle: `/` refers to it and `..` cannot leave it.
    pub fn open_dir(&self, path: &str, as_root: bool) -> VfsResult<DirHandle> {
        let top = DirHandle {
            repo: self.clone(),
            comps: Vec::new(),
            root_end: 0,
        };
        let comps = verify_path(&top, path)?;
        let root_end = if as_root { comps.len() } else { 0 };
        Ok(DirHandle {
            repo: self.clone(),
            comps,
            root_end,
        })
    }
}

/// Split off the last component, keeping a lone leading `/` as the
/// directory part.
fn split_parent(path: &str) -> (&str, &str) {
    let (dir, name) = split_last(path);
    if dir.is_empty() && path.starts_with('/') {
        ("/", name)
    } else {
        (dir, name)
    }
}

impl DirHandle {
    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub(crate) fn comps(&self) -> &[String] {
        &self.comps
    }

    pub(crate) fn root_end(&self) -> usize {
        self.root_end
    }

    /// Absolute virtual path of the directory.
    pub fn path(&self) -> String {
        format!("/{}", self.comps.join("/"))
    }

    /// Open the directory `path` relative to this one. The new handle keeps
    /// this handle's root unless `as_root` is set.
    pub fn open_dir_relative(&self, path: &str, as_root: bool) -> VfsResult<DirHandle> {
        let comps = verify_path(self, path)?;
        let root_end = if as_root { comps.len() } else { self.root_end };
        Ok(DirHandle {
            repo: self.repo.clone(),
            comps,
            root_end,
        })
    }

    /// Decide where a write-capable open of `path` happens, copying the file
    /// up from a lower layer when needed.
    fn prepare_open(&self, path: &str, mut flags: OpenFlags) -> VfsResult<(Location, String, OpenFlags)> {
        let access = get_physical_access(self, path, flags, false)?;
        let Some(write) = access.write.clone() else {
            return Ok((access.read, access.name, flags));
        };
        if access.same_location() {
            return Ok((write, access.name, flags));
        }

        if access.read.dir.get_entry(&access.name)?.is_some() {
            if flags.create && flags.exclusive {
                return Err(VfsError::already_exists(path));
            }
            if flags.truncate {
                // Nothing worth copying; create it fresh in the write layer.
                flags.create = true;
            } else {
                debug!(
                    from = %access.read.proot_path,
                    to = %write.proot_path,
                    "copying file up for writing"
                );
                copy_file_physical(&access.read.dir, &access.name, &write.dir, &access.name)?;
            }
        } else if !flags.create {
            return Err(VfsError::not_found(path));
        }
        Ok((write, access.name, flags))
    }

    /// Open a file.
    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Handle> {
        let (loc, name, flags) = self.prepare_open(path, flags)?;
        let native = loc.dir.handler().open(&loc.dir, &name, flags, mode)?;
        Ok(Handle::new(Arc::clone(loc.dir.root()), native, flags))
    }

    /// The mount and physical path `path` would be opened at with `flags`.
    ///
    /// Resolves exactly like [`DirHandle::open`], including copying the
    /// file into the write layer.
    pub fn get_file_location(&self, path: &str, flags: OpenFlags) -> VfsResult<(MountHandle, String)> {
        let (loc, _, _) = self.prepare_open(path, flags)?;
        Ok((self.repo.handle_of(&loc.mount), loc.proot_path))
    }

    /// Attributes of `path`. A directory that only exists as a mount point
    /// reports the attributes of its highest physical directory.
    pub fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        let access = match get_physical_access(self, path, OpenFlags::read(), false) {
            Ok(access) => access,
            Err(_) => return self.stat_dir(path),
        };
        let dir = &access.read.dir;
        if !dir.root().supports(Capability::Stat) {
            return Err(VfsError::not_supported("stat"));
        }
        dir.handler().stat(dir, &access.name)
    }

    fn stat_dir(&self, path: &str) -> VfsResult<FileAttr> {
        let dirs = get_path_physical_dirs(self, path)?;
        let Some(first) = dirs.first() else {
            return Err(VfsError::not_found(path));
        };
        if !first.pdir.root().supports(Capability::Stat) {
            return Err(VfsError::not_supported("stat"));
        }
        first.pdir.handler().stat(&first.pdir, ".")
    }

    /// Permission checks are not available.
    pub fn access(&self, _path: &str, _mode: u32) -> VfsResult<()> {
        Err(VfsError::not_supported("access"))
    }

    /// Create a directory in the highest writable layer, creating missing
    /// parents in that layer.
    pub fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        let access = get_physical_access(self, path, OpenFlags::create_exclusive(), false)
            .map_err(|e| match e {
                VfsError::IsADirectory(p) => VfsError::AlreadyExists(p),
                other => other,
            })?;
        let Some(write) = access.write else {
            return Err(VfsError::permission_denied(path));
        };
        if !write.dir.root().supports(Capability::Mkdir) {
            return Err(VfsError::not_supported("mkdir"));
        }
        write.dir.handler().mkdir(&write.dir, &access.name, mode)?;
        Ok(())
    }

    fn remove_entry(&self, path: &str, want_dir: bool) -> VfsResult<()> {
        let (parent, name) = split_parent(path);
        if name.is_empty() {
            return Err(VfsError::not_found(path));
        }
        let cap = if want_dir {
            Capability::Rmdir
        } else {
            Capability::Unlink
        };

        let mut targets = Vec::new();
        for loc in get_path_physical_dirs(self, parent)? {
            let Some(entry) = loc.pdir.get_entry(name)? else {
                continue;
            };
            match (entry.is_dir(), want_dir) {
                (false, true) => return Err(VfsError::not_a_directory(path)),
                (true, false) => return Err(VfsError::is_a_directory(path)),
                _ => {}
            }
            if loc.mount.is_read_only() {
                return Err(VfsError::read_only(path));
            }
            if !loc.pdir.root().supports(cap) {
                return Err(VfsError::not_supported(cap.to_string()));
            }
            targets.push(loc);
        }
        if targets.is_empty() {
            return Err(VfsError::not_found(path));
        }

        for loc in &targets {
            let handler = loc.pdir.handler();
            if want_dir {
                handler.rmdir(&loc.pdir, name)?;
            } else {
                handler.unlink(&loc.pdir, name)?;
            }
        }
        Ok(())
    }

    /// Remove a directory from every layer that has it. Fails with
    /// `ReadOnly`, deleting nothing, when a read-only layer holds it.
    pub fn rmdir(&self, path: &str) -> VfsResult<()> {
        self.remove_entry(path, true)
    }

    /// Remove a file from every layer that has it. Fails with `ReadOnly`,
    /// deleting nothing, when a read-only layer holds it.
    pub fn unlink(&self, path: &str) -> VfsResult<()> {
        self.remove_entry(path, false)
    }

    /// Rename `old_path` to `new_path` in `new_dir`. Both must live in the
    /// same writable mount.
    pub fn rename(&self, old_path: &str, new_dir: &DirHandle, new_path: &str) -> VfsResult<()> {
        let old = get_physical_access(self, old_path, OpenFlags::read(), false)?;
        let new = get_physical_access(new_dir, new_path, OpenFlags::create_exclusive(), true)?;
        let Some(target) = new.write else {
            return Err(VfsError::permission_denied(new_path));
        };

        if !Arc::ptr_eq(&old.read.mount, &target.mount) {
            return Err(VfsError::cross_device(format!("{old_path} -> {new_path}")));
        }
        if old.read.mount.is_read_only() {
            return Err(VfsError::read_only(old_path));
        }
        if !old.read.dir.root().supports(Capability::Rename) {
            return Err(VfsError::not_supported("rename"));
        }
        old.read
            .dir
            .handler()
            .rename(&old.read.dir, &old.name, &target.dir, &new.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Uio;
    use crate::error::VfsErrorKind;
    use crate::fstypes::FileSystemId;
    use crate::repository::MountRequest;
    use crate::types::MountLocation;
    use std::fs;
    use tempfile::TempDir;

    /// A repository with `lower` mounted read-only at `/` and the empty,
    /// writable `upper` above it.
    fn setup() -> (DirHandle, TempDir) {
        let tmp = TempDir::new().unwrap();
        let lower = tmp.path().join("lower");
        let upper = tmp.path().join("upper");
        fs::create_dir_all(lower.join("sub/deeper")).unwrap();
        fs::create_dir(&upper).unwrap();
        fs::write(lower.join("x.txt"), b"lower x").unwrap();
        fs::write(lower.join("sub/y.txt"), b"lower y").unwrap();

        let repo = Uio::init().open_repository();
        let low = repo
            .mount_dir(
                "/",
                MountRequest::new(FileSystemId::STDIO)
                    .in_path(lower.to_str().unwrap())
                    .read_only(true),
            )
            .unwrap();
        repo.mount_dir(
            "/",
            MountRequest::new(FileSystemId::STDIO)
                .in_path(upper.to_str().unwrap())
                .location(MountLocation::Above(&low)),
        )
        .unwrap();
        (repo.open_dir("/", false).unwrap(), tmp)
    }

    fn read_all(handle: &Handle) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = handle.read(&mut buf).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn test_dotdot_stays_inside_root() {
        let (top, _tmp) = setup();
        let sub = top.open_dir_relative("sub", true).unwrap();
        assert_eq!(sub.path(), "/sub");

        let err = sub.open_dir_relative("..", false).unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::NotFound);

        let deeper = sub.open_dir_relative("deeper/../deeper", false).unwrap();
        assert_eq!(deeper.path(), "/sub/deeper");
        assert_eq!(deeper.open_dir_relative("..", false).unwrap().path(), "/sub");
        assert_eq!(deeper.open_dir_relative("/", false).unwrap().path(), "/sub");
    }

    #[test]
    fn test_open_dir_errors() {
        let (top, _tmp) = setup();
        let repo = top.repository();
        assert_eq!(repo.open_dir("/nope", false).unwrap_err().kind(), VfsErrorKind::NotFound);
        assert_eq!(
            repo.open_dir("/x.txt", false).unwrap_err().kind(),
            VfsErrorKind::NotADirectory
        );
    }

    #[test]
    fn test_copy_on_write_leaves_lower_untouched() {
        let (top, tmp) = setup();
        let handle = top.open("/x.txt", OpenFlags::read_write(), 0).unwrap();
        assert_eq!(read_all(&handle), b"lower x");
        handle.write(b"!").unwrap();
        drop(handle);

        assert_eq!(fs::read(tmp.path().join("lower/x.txt")).unwrap(), b"lower x");
        assert_eq!(fs::read(tmp.path().join("upper/x.txt")).unwrap(), b"lower x!");

        let handle = top.open("x.txt", OpenFlags::read(), 0).unwrap();
        assert_eq!(read_all(&handle), b"lower x!");
    }

    #[test]
    fn test_create_in_missing_parent_makes_path() {
        let (top, tmp) = setup();
        let handle = top.open("/sub/new.txt", OpenFlags::create(), 0o644).unwrap();
        handle.write(b"new").unwrap();
        drop(handle);
        assert_eq!(fs::read(tmp.path().join("upper/sub/new.txt")).unwrap(), b"new");
        assert!(!tmp.path().join("lower/sub/new.txt").exists());

        let err = top.open("/sub/y.txt", OpenFlags::create_exclusive(), 0).unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::AlreadyExists);
        let err = top.open("/sub/missing.txt", OpenFlags::write(), 0).unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::NotFound);
        let err = top.open("/sub", OpenFlags::read(), 0).unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::IsADirectory);
        let err = top.open("/x.txt/z", OpenFlags::read(), 0).unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::NotADirectory);
    }

    #[test]
    fn test_get_file_location() {
        let (top, _tmp) = setup();
        let (mount, path) = top.get_file_location("sub/y.txt", OpenFlags::read()).unwrap();
        assert!(mount.info().is_read_only());
        assert!(path.ends_with("/lower/sub/y.txt"));

        let (mount, path) = top.get_file_location("sub/y.txt", OpenFlags::read_write()).unwrap();
        assert!(!mount.info().is_read_only());
        assert!(path.ends_with("/upper/sub/y.txt"));
    }

    #[test]
    fn test_stat_and_mkdir() {
        let (top, tmp) = setup();
        assert_eq!(top.stat("x.txt").unwrap().size, 7);
        assert!(top.stat("/").unwrap().is_dir());
        assert!(top.stat("sub").unwrap().is_dir());
        assert_eq!(top.stat("nothing").unwrap_err().kind(), VfsErrorKind::NotFound);

        top.mkdir("sub/made", 0o755).unwrap();
        assert!(tmp.path().join("upper/sub/made").is_dir());
        assert_eq!(top.mkdir("sub", 0o755).unwrap_err().kind(), VfsErrorKind::AlreadyExists);
        assert_eq!(top.access("x.txt", 0).unwrap_err().kind(), VfsErrorKind::NotSupported);
    }

    #[test]
    fn test_unlink_and_rmdir_across_layers() {
        let (top, tmp) = setup();
        assert_eq!(top.unlink("x.txt").unwrap_err().kind(), VfsErrorKind::ReadOnly);
        assert_eq!(top.unlink("sub").unwrap_err().kind(), VfsErrorKind::IsADirectory);
        assert_eq!(top.rmdir("x.txt").unwrap_err().kind(), VfsErrorKind::NotADirectory);
        assert_eq!(top.unlink("ghost").unwrap_err().kind(), VfsErrorKind::NotFound);

        drop(top.open("/a.txt", OpenFlags::create(), 0o644).unwrap());
        top.unlink("/a.txt").unwrap();
        assert!(!tmp.path().join("upper/a.txt").exists());
        assert_eq!(top.stat("a.txt").unwrap_err().kind(), VfsErrorKind::NotFound);

        top.mkdir("/empty", 0o755).unwrap();
        top.rmdir("/empty").unwrap();
        assert!(!tmp.path().join("upper/empty").exists());
    }

    #[test]
    fn test_unlink_copied_up_file_keeps_both_copies() {
        let (top, tmp) = setup();
        drop(top.open("/x.txt", OpenFlags::read_write(), 0).unwrap());
        assert!(tmp.path().join("upper/x.txt").exists());

        let err = top.unlink("x.txt").unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::ReadOnly);
        assert!(tmp.path().join("upper/x.txt").exists());
        assert!(tmp.path().join("lower/x.txt").exists());
        assert_eq!(top.stat("x.txt").unwrap().size, 7);
    }

    #[test]
    fn test_rmdir_blocked_by_read_only_layer() {
        let (top, tmp) = setup();
        fs::create_dir_all(tmp.path().join("upper/sub/deeper")).unwrap();

        let err = top.rmdir("sub/deeper").unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::ReadOnly);
        assert!(tmp.path().join("upper/sub/deeper").is_dir());
    }

    #[test]
    fn test_rename_rules() {
        let (top, tmp) = setup();
        let err = top.rename("x.txt", &top, "y.txt").unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::CrossDevice);

        drop(top.open("a.txt", OpenFlags::create(), 0o644).unwrap());
        top.rename("a.txt", &top, "b.txt").unwrap();
        assert!(tmp.path().join("upper/b.txt").exists());
        assert!(!tmp.path().join("upper/a.txt").exists());
        assert_eq!(top.stat("b.txt").unwrap().size, 0);
    }
}
