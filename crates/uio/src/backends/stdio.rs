//! Host filesystem backend.
//!
//! Mounts the host root. The repository selects a host directory as the
//! mount root through the mount's `in_path`, so `/home/amy/game` mounted
//! at `/` makes `/content/x.txt` refer to `/home/amy/game/content/x.txt`.
//!
//! Directory nodes are created lazily as paths are walked; every node is
//! marked complete and lookups that miss the cache ask the host.

use parking_lot::RwLock;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::error::{VfsError, VfsResult};
use crate::fstypes::{
    Capability, EntriesIter, FileSystemHandler, MountedTree, NameListEntries, NativeFile,
};
use crate::gphys::{GpDir, GpFile, GpRoot};
use crate::paths::{unc_server_share, PathStyle};
use crate::physical::{Handle, PDirEntryHandle, PDirHandle, PFileHandle};
use crate::types::{AccessMode, FileAttr, FileType, MountFlags, OpenFlags};

/// Host path of a cached directory.
#[derive(Debug)]
struct HostDir {
    path: RwLock<PathBuf>,
}

/// Host filesystem handler.
#[derive(Debug, Default)]
pub struct StdioFs;

impl StdioFs {
    pub fn new() -> Self {
        Self
    }

    fn host_path(dir: &GpDir) -> VfsResult<PathBuf> {
        dir.extra::<HostDir>()
            .map(|d| d.path.read().clone())
            .ok_or_else(|| VfsError::corrupt("host directory without a path"))
    }

    fn entry_path(dir: &PDirHandle, name: &str) -> VfsResult<PathBuf> {
        let base = Self::host_path(dir.dir())?;
        if base.as_os_str().is_empty() {
            // Top of a drive-letter host: names carry their own anchor.
            return Ok(PathBuf::from(format!("{name}/")));
        }
        Ok(base.join(name))
    }

    fn add_dir(parent: &GpDir, name: &str) -> VfsResult<Arc<GpDir>> {
        let sub = parent.prepare_sub_dir(name);
        if sub.extra::<HostDir>().is_none() {
            let base = Self::host_path(parent)?;
            let path = if base.as_os_str().is_empty() {
                PathBuf::from(format!("{name}/"))
            } else {
                base.join(name)
            };
            sub.set_extra(Arc::new(HostDir {
                path: RwLock::new(path),
            }));
            sub.set_complete(true);
        }
        parent.commit_sub_dir(name, &sub);
        Ok(sub)
    }

    fn add_file(parent: &GpDir, name: &str) -> Arc<GpFile> {
        let file = GpFile::new(None);
        parent.add_file(name, Arc::clone(&file));
        file
    }

    /// Point a moved directory and its cached descendants at their new
    /// host location.
    fn rebase(dir: &GpDir, path: PathBuf) {
        for (name, sub) in dir.cached_sub_dirs() {
            Self::rebase(&sub, path.join(name));
        }
        if let Some(host) = dir.extra::<HostDir>() {
            *host.path.write() = path;
        }
    }

    fn is_top(dir: &PDirHandle) -> bool {
        PathStyle::host() == PathStyle::Windows
            && Self::host_path(dir.dir())
                .map(|p| p.as_os_str().is_empty())
                .unwrap_or(false)
    }
}

/// Convert host metadata to attributes.
pub(crate) fn metadata_to_attr(meta: &fs::Metadata) -> FileAttr {
    let kind = if meta.is_dir() {
        FileType::Directory
    } else {
        FileType::File
    };

    #[cfg(unix)]
    let (perm, uid, gid) = {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};
        (meta.permissions().mode(), Some(meta.uid()), Some(meta.gid()))
    };
    #[cfg(not(unix))]
    let (perm, uid, gid) = {
        let base = if meta.is_dir() { 0o755 } else { 0o644 };
        let perm = if meta.permissions().readonly() {
            base & !0o222
        } else {
            base
        };
        (perm, None, None)
    };

    FileAttr {
        size: meta.len(),
        kind,
        perm,
        mtime: meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        atime: meta.accessed().ok(),
        ctime: meta.created().ok(),
        uid,
        gid,
    }
}

/// An open host file.
#[derive(Debug)]
pub struct StdioFile {
    file: fs::File,
}

impl NativeFile for StdioFile {
    fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        Ok(self.file.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> VfsResult<usize> {
        Ok(self.file.write(buf)?)
    }

    fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        Ok(self.file.seek(pos)?)
    }

    fn fstat(&mut self) -> VfsResult<FileAttr> {
        Ok(metadata_to_attr(&self.file.metadata()?))
    }

    fn close(&mut self) -> VfsResult<()> {
        Ok(self.file.flush()?)
    }
}

impl FileSystemHandler for StdioFs {
    fn supports(&self, _cap: Capability) -> bool {
        true
    }

    fn mount(&self, source: Option<Handle>, flags: MountFlags) -> VfsResult<MountedTree> {
        if source.is_some() {
            return Err(VfsError::invalid_argument(
                "host filesystem is not mounted from a file",
            ));
        }
        let top = match PathStyle::host() {
            PathStyle::Posix => PathBuf::from("/"),
            PathStyle::Windows => PathBuf::new(),
        };
        let root_dir = GpRoot::new(None, true, flags.nocache).make_root_dir(true);
        root_dir.set_extra(Arc::new(HostDir {
            path: RwLock::new(top),
        }));
        Ok(MountedTree {
            root_dir,
            extra: None,
        })
    }

    fn open(
        &self,
        dir: &PDirHandle,
        name: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<Box<dyn NativeFile>> {
        let path = Self::entry_path(dir, name)?;
        let mut options = fs::OpenOptions::new();
        options
            .read(flags.readable())
            .write(flags.access != AccessMode::ReadOnly)
            .append(flags.append)
            .truncate(flags.truncate);
        if flags.create && flags.exclusive {
            options.create_new(true);
        } else if flags.create {
            options.create(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let file = options.open(&path)?;
        Ok(Box::new(StdioFile { file }))
    }

    fn stat(&self, dir: &PDirHandle, name: &str) -> VfsResult<FileAttr> {
        let path = if name == "." {
            Self::host_path(dir.dir())?
        } else {
            Self::entry_path(dir, name)?
        };
        Ok(metadata_to_attr(&fs::metadata(path)?))
    }

    fn mkdir(&self, dir: &PDirHandle, name: &str, mode: u32) -> VfsResult<PDirHandle> {
        let path = Self::entry_path(dir, name)?;
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        builder.create(&path)?;

        let sub = Self::add_dir(dir.dir(), name)?;
        Ok(PDirHandle::new(Arc::clone(dir.root()), sub))
    }

    fn rename(
        &self,
        old_dir: &PDirHandle,
        old_name: &str,
        new_dir: &PDirHandle,
        new_name: &str,
    ) -> VfsResult<()> {
        let old_path = Self::entry_path(old_dir, old_name)?;
        let new_path = Self::entry_path(new_dir, new_name)?;
        fs::rename(&old_path, &new_path)?;

        if let Some(PDirEntryHandle::Dir(moved)) = old_dir.lookup_cached(old_name) {
            Self::rebase(moved.dir(), new_path);
        }
        old_dir
            .dir()
            .move_entry(old_name, new_dir.dir(), new_name);
        Ok(())
    }

    fn rmdir(&self, dir: &PDirHandle, name: &str) -> VfsResult<()> {
        fs::remove_dir(Self::entry_path(dir, name)?)?;
        dir.dir().remove_sub_dir(name);
        Ok(())
    }

    fn unlink(&self, dir: &PDirHandle, name: &str) -> VfsResult<()> {
        fs::remove_file(Self::entry_path(dir, name)?)?;
        dir.dir().remove_file(name);
        Ok(())
    }

    fn open_entries(&self, dir: &PDirHandle) -> VfsResult<Box<dyn EntriesIter>> {
        let path = Self::host_path(dir.dir())?;
        if path.as_os_str().is_empty() {
            return Ok(Box::new(NameListEntries::new(Vec::new())));
        }
        let names = fs::read_dir(&path)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Box::new(NameListEntries::new(names)))
    }

    fn get_entry(&self, dir: &PDirHandle, name: &str) -> VfsResult<Option<PDirEntryHandle>> {
        let top = Self::is_top(dir);
        let name = if top {
            match top_level_name(name) {
                Some(n) => n,
                None => return Ok(None),
            }
        } else {
            name.to_string()
        };

        if let Some(entry) = dir.lookup_cached(&name) {
            return Ok(Some(entry));
        }

        if top {
            // Nonexistent drives just show up empty.
            let sub = Self::add_dir(dir.dir(), &name)?;
            return Ok(Some(PDirEntryHandle::Dir(PDirHandle::new(
                Arc::clone(dir.root()),
                sub,
            ))));
        }

        let path = Self::entry_path(dir, &name)?;
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(
                        path = %path.display(),
                        error = %e,
                        "treating unreadable entry as absent"
                    );
                }
                return Ok(None);
            }
        };

        if meta.is_file() {
            let file = Self::add_file(dir.dir(), &name);
            Ok(Some(PDirEntryHandle::File(PFileHandle::new(
                Arc::clone(dir.root()),
                file,
            ))))
        } else if meta.is_dir() {
            let sub = Self::add_dir(dir.dir(), &name)?;
            Ok(Some(PDirEntryHandle::Dir(PDirHandle::new(
                Arc::clone(dir.root()),
                sub,
            ))))
        } else {
            debug!(path = %path.display(), "neither a regular file nor a directory");
            Ok(None)
        }
    }
}

/// Names valid directly under a drive-letter host's top: `c:` style
/// drives (lowercased) and `\\server\share`.
fn top_level_name(name: &str) -> Option<String> {
    let b = name.as_bytes();
    if b.len() == 2 && b[0].is_ascii_alphabetic() && b[1] == b':' {
        return Some(name.to_ascii_lowercase());
    }
    match unc_server_share(name) {
        Some((_, len)) if len == name.len() => Some(name.to_string()),
        _ => None,
    }
}

/// Host path a physical directory maps to.
pub fn host_dir_path(dir: &PDirHandle) -> Option<PathBuf> {
    StdioFs::host_path(dir.dir()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fstypes::FileSystemId;
    use crate::physical::PRoot;
    use tempfile::TempDir;

    fn setup() -> (PDirHandle, TempDir) {
        let dir = TempDir::new().unwrap();
        let handler: Arc<dyn FileSystemHandler> = Arc::new(StdioFs::new());
        let tree = handler.mount(None, MountFlags::read_write()).unwrap();
        let root = PRoot::new(FileSystemId::STDIO, handler, MountFlags::read_write(), tree, None);
        let mut handle = root.root_dir_handle().unwrap();
        for comp in crate::paths::components(&dir.path().to_string_lossy()) {
            handle = match handle.get_entry(comp).unwrap() {
                Some(PDirEntryHandle::Dir(d)) => d,
                other => panic!("expected directory at {comp}: {other:?}"),
            };
        }
        (handle, dir)
    }

    #[test]
    fn test_lookup_consults_host() {
        let (handle, dir) = setup();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        assert!(matches!(
            handle.get_entry("a.txt").unwrap(),
            Some(PDirEntryHandle::File(_))
        ));
        assert!(handle.get_entry("sub").unwrap().unwrap().is_dir());
        assert!(handle.get_entry("missing").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_entries_are_absent() {
        let (handle, dir) = setup();
        std::os::unix::fs::symlink("loop", dir.path().join("loop")).unwrap();
        std::os::unix::fs::symlink("missing", dir.path().join("dangling")).unwrap();

        assert!(handle.get_entry("loop").unwrap().is_none());
        assert!(handle.get_entry("dangling").unwrap().is_none());
    }

    #[test]
    fn test_open_read_write() {
        let (handle, dir) = setup();
        let stdio = handle.handler().clone();

        let mut file = stdio
            .open(&handle, "new.txt", OpenFlags::create_exclusive(), 0o644)
            .unwrap();
        assert_eq!(file.write(b"abc").unwrap(), 3);
        file.close().unwrap();
        assert_eq!(fs::read(dir.path().join("new.txt")).unwrap(), b"abc");

        let err = match stdio.open(&handle, "new.txt", OpenFlags::create_exclusive(), 0o644) {
            Err(e) => e,
            Ok(_) => panic!("exclusive create of an existing file succeeded"),
        };
        assert_eq!(err.kind(), crate::error::VfsErrorKind::AlreadyExists);

        let mut file = stdio.open(&handle, "new.txt", OpenFlags::read(), 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf).unwrap(), 3);
        assert_eq!(file.fstat().unwrap().size, 3);
    }

    #[test]
    fn test_mkdir_rmdir_unlink() {
        let (handle, dir) = setup();
        let stdio = handle.handler().clone();

        let sub = stdio.mkdir(&handle, "made", 0o755).unwrap();
        assert!(dir.path().join("made").is_dir());
        assert!(handle.lookup_cached("made").is_some());
        assert!(stdio.stat(&sub, ".").unwrap().is_dir());

        stdio.rmdir(&handle, "made").unwrap();
        assert!(!dir.path().join("made").exists());
        assert!(handle.get_entry("made").unwrap().is_none());

        fs::write(dir.path().join("f"), b"x").unwrap();
        assert!(handle.get_entry("f").unwrap().is_some());
        stdio.unlink(&handle, "f").unwrap();
        assert!(handle.get_entry("f").unwrap().is_none());
    }

    #[test]
    fn test_rename_rebases_cached_dirs() {
        let (handle, dir) = setup();
        let stdio = handle.handler().clone();
        fs::create_dir_all(dir.path().join("old/inner")).unwrap();
        fs::write(dir.path().join("old/inner/x"), b"1").unwrap();

        let old = match handle.get_entry("old").unwrap() {
            Some(PDirEntryHandle::Dir(d)) => d,
            other => panic!("{other:?}"),
        };
        let inner = match old.get_entry("inner").unwrap() {
            Some(PDirEntryHandle::Dir(d)) => d,
            other => panic!("{other:?}"),
        };

        stdio.rename(&handle, "old", &handle, "new").unwrap();
        assert!(handle.lookup_cached("old").is_none());
        assert_eq!(
            host_dir_path(&inner).unwrap(),
            dir.path().join("new").join("inner")
        );
        assert!(inner.get_entry("x").unwrap().is_some());
    }

    #[test]
    fn test_open_entries() {
        let (handle, dir) = setup();
        fs::write(dir.path().join("one"), b"").unwrap();
        fs::write(dir.path().join("two"), b"").unwrap();

        let mut entries = handle.handler().open_entries(&handle).unwrap();
        let mut buf = crate::fstypes::EntryBuffer::new(2048);
        entries.read_entries(&mut buf).unwrap();
        assert!(buf.is_finished());
        let mut names = buf.drain();
        names.sort();
        assert_eq!(names, vec!["one", "two"]);
    }

    #[test]
    fn test_top_level_names() {
        assert_eq!(top_level_name("C:").as_deref(), Some("c:"));
        assert_eq!(
            top_level_name("\\\\srv\\share").as_deref(),
            Some("\\\\srv\\share")
        );
        assert!(top_level_name("games").is_none());
    }
}
