//! Read-only zip archive backend.
//!
//! The archive is read from a file inside the repository (the mount's
//! source) through a [`FileBlock`]. The whole directory tree is built from
//! the central directory at mount time, so every node is complete and no
//! lookup ever goes back to the archive. File contents are inflated per
//! open handle.

use parking_lot::Mutex;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::SystemTime;
use time::OffsetDateTime;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::{VfsError, VfsResult};
use crate::fileblock::{BlockReader, FileBlock};
use crate::fstypes::{Capability, FileSystemHandler, MountedTree, NativeFile};
use crate::gphys::{GpDir, GpEntry, GpFile, GpRoot};
use crate::physical::{Handle, PDirHandle};
use crate::types::{FileAttr, FileType, MountFlags, OpenFlags};

/// Read-only zip handler.
#[derive(Debug, Default)]
pub struct ZipFs;

impl ZipFs {
    pub fn new() -> Self {
        Self
    }
}

struct ZipRoot {
    archive: Mutex<ZipArchive<BlockReader>>,
}

/// Central directory data for one entry.
#[derive(Debug, Clone)]
struct ZipEntry {
    index: usize,
    attr: FileAttr,
}

/// Convert a DOS timestamp (taken as UTC) to a system time.
fn zip_time(dt: zip::DateTime) -> SystemTime {
    match OffsetDateTime::try_from(dt) {
        Ok(time) => time.into(),
        Err(e) => {
            debug!(error = %e, "zip entry has an invalid timestamp");
            SystemTime::UNIX_EPOCH
        }
    }
}

/// Largest buffer reserved up front when inflating an entry. The size in
/// the central directory is not trusted beyond this.
const MAX_PRESIZE: u64 = 1 << 20;

fn initial_capacity(size: u64) -> usize {
    // Bounded by MAX_PRESIZE, so it fits.
    size.min(MAX_PRESIZE) as usize
}

/// Split an archive entry name into components, rejecting names that
/// cannot be represented in a directory tree.
fn entry_components(name: &str) -> Option<(Vec<&str>, bool)> {
    let is_dir = name.ends_with('/');
    let trimmed = name.strip_suffix('/').unwrap_or(name);
    if trimmed.is_empty() {
        return None;
    }
    let comps: Vec<&str> = trimmed.split('/').collect();
    if comps.iter().any(|c| c.is_empty() || *c == "." || *c == "..") {
        return None;
    }
    Some((comps, is_dir))
}

/// Descend to `name` below `dir`, creating complete directory nodes.
/// Fails when a file is in the way.
fn sub_dir(dir: &Arc<GpDir>, name: &str) -> Option<Arc<GpDir>> {
    match dir.get_entry(name) {
        Some(GpEntry::Dir(d)) => Some(d),
        Some(GpEntry::File(_)) => None,
        None => {
            let sub = dir.prepare_sub_dir(name);
            sub.set_complete(true);
            dir.commit_sub_dir(name, &sub);
            Some(sub)
        }
    }
}

fn build_tree(archive: &mut ZipArchive<BlockReader>) -> VfsResult<Arc<GpDir>> {
    let root = GpRoot::new(None, true, false).make_root_dir(true);

    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        let name = entry.name().to_string();
        let Some((comps, is_dir)) = entry_components(&name) else {
            warn!(entry = %name, "skipping zip entry with an invalid path");
            continue;
        };
        let is_dir = is_dir || entry.is_dir();

        let kind = if is_dir {
            FileType::Directory
        } else {
            FileType::File
        };
        let default_perm = if is_dir { 0o755 } else { 0o644 };
        let attr = FileAttr {
            size: if is_dir { 0 } else { entry.size() },
            kind,
            perm: entry.unix_mode().map(|m| m & 0o7777).unwrap_or(default_perm),
            mtime: entry
                .last_modified()
                .map(zip_time)
                .unwrap_or(SystemTime::UNIX_EPOCH),
            atime: None,
            ctime: None,
            uid: None,
            gid: None,
        };
        drop(entry);

        let (last, parents) = match comps.split_last() {
            Some(split) => split,
            None => continue,
        };
        let mut dir = Arc::clone(&root);
        let mut blocked = false;
        for comp in parents {
            match sub_dir(&dir, comp) {
                Some(d) => dir = d,
                None => {
                    blocked = true;
                    break;
                }
            }
        }
        if blocked {
            warn!(entry = %name, "skipping zip entry below a file");
            continue;
        }

        let extra = Arc::new(ZipEntry { index, attr });
        if is_dir {
            match sub_dir(&dir, last) {
                Some(d) => d.set_extra(extra),
                None => warn!(entry = %name, "skipping zip directory that is also a file"),
            }
        } else if dir.get_entry(last).is_some() {
            warn!(entry = %name, "skipping duplicate zip entry");
        } else {
            dir.add_file(last, GpFile::new(Some(extra)));
        }
    }

    Ok(root)
}

fn synthetic_dir_attr() -> FileAttr {
    FileAttr::directory(0o777)
}

/// An inflated archive member.
#[derive(Debug)]
pub struct ZipFile {
    data: Cursor<Vec<u8>>,
    attr: FileAttr,
}

impl NativeFile for ZipFile {
    fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        Ok(self.data.read(buf)?)
    }

    fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        let len = self.data.get_ref().len() as i64;
        let target = match pos {
            SeekFrom::Start(n) => i64::try_from(n).unwrap_or(i64::MAX),
            SeekFrom::End(d) => len.saturating_add(d),
            SeekFrom::Current(d) => (self.data.position() as i64).saturating_add(d),
        };
        let target = target.clamp(0, len) as u64;
        self.data.set_position(target);
        Ok(target)
    }

    fn fstat(&mut self) -> VfsResult<FileAttr> {
        Ok(self.attr.clone())
    }
}

impl FileSystemHandler for ZipFs {
    fn supports(&self, cap: Capability) -> bool {
        matches!(cap, Capability::Stat | Capability::Fstat | Capability::Seek)
    }

    fn mount(&self, source: Option<Handle>, flags: MountFlags) -> VfsResult<MountedTree> {
        if !flags.read_only {
            return Err(VfsError::permission_denied("zip archives can only be mounted read-only"));
        }
        let source =
            source.ok_or_else(|| VfsError::invalid_argument("zip mount needs a source file"))?;

        let block = FileBlock::open(source)?;
        let mut archive = ZipArchive::new(block.into_reader())?;
        let root_dir = build_tree(&mut archive)?;
        debug!(entries = archive.len(), "mounted zip archive");

        Ok(MountedTree {
            root_dir,
            extra: Some(Arc::new(ZipRoot {
                archive: Mutex::new(archive),
            })),
        })
    }

    fn open(
        &self,
        dir: &PDirHandle,
        name: &str,
        flags: OpenFlags,
        _mode: u32,
    ) -> VfsResult<Box<dyn NativeFile>> {
        if flags.writable() {
            return Err(VfsError::permission_denied(name));
        }
        let entry = match dir.dir().get_entry(name) {
            Some(GpEntry::File(file)) => file
                .extra::<ZipEntry>()
                .ok_or_else(|| VfsError::corrupt(format!("zip entry {name} without data")))?,
            Some(GpEntry::Dir(_)) => return Err(VfsError::is_a_directory(name)),
            None => return Err(VfsError::not_found(name)),
        };

        let root = dir
            .root()
            .extra::<ZipRoot>()
            .ok_or_else(|| VfsError::corrupt("zip archive already released"))?;
        let mut archive = root.archive.lock();
        let mut member = archive.by_index(entry.index)?;
        let mut data = Vec::with_capacity(initial_capacity(entry.attr.size));
        member.read_to_end(&mut data)?;

        Ok(Box::new(ZipFile {
            data: Cursor::new(data),
            attr: entry.attr.clone(),
        }))
    }

    fn stat(&self, dir: &PDirHandle, name: &str) -> VfsResult<FileAttr> {
        if name == "." {
            return Ok(dir
                .dir()
                .extra::<ZipEntry>()
                .map(|e| e.attr.clone())
                .unwrap_or_else(synthetic_dir_attr));
        }
        match dir.dir().get_entry(name) {
            Some(GpEntry::File(file)) => file
                .extra::<ZipEntry>()
                .map(|e| e.attr.clone())
                .ok_or_else(|| VfsError::corrupt(format!("zip entry {name} without data"))),
            Some(GpEntry::Dir(sub)) => Ok(sub
                .extra::<ZipEntry>()
                .map(|e| e.attr.clone())
                .unwrap_or_else(synthetic_dir_attr)),
            None => Err(VfsError::not_found(name)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fileblock::tests::mem_handle;
    use crate::fstypes::FileSystemId;
    use crate::physical::{PDirEntryHandle, PRoot};
    use std::io::Write;
    use std::time::Duration;
    use zip::write::SimpleFileOptions;

    /// Build an archive in memory from `(name, contents)` pairs; names
    /// ending in `/` become directory entries.
    pub(crate) fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, contents) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(contents).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    fn setup(entries: &[(&str, &[u8])]) -> PDirHandle {
        let (source, _) = mem_handle(build_zip(entries));
        let handler: Arc<dyn FileSystemHandler> = Arc::new(ZipFs::new());
        let tree = handler
            .mount(Some(source), MountFlags::read_only())
            .unwrap();
        let root = PRoot::new(FileSystemId::ZIP, handler, MountFlags::read_only(), tree, None);
        root.root_dir_handle().unwrap()
    }

    fn dir(handle: &PDirHandle, name: &str) -> PDirHandle {
        match handle.get_entry(name).unwrap() {
            Some(PDirEntryHandle::Dir(d)) => d,
            other => panic!("expected directory {name}: {other:?}"),
        }
    }

    #[test]
    fn test_tree_from_central_directory() {
        let top = setup(&[
            ("readme.txt", b"hi"),
            ("content/", b""),
            ("content/ships/flagship.txt", b"vessel"),
        ]);
        assert_eq!(top.dir().entry_names(), vec!["content", "readme.txt"]);

        let ships = dir(&dir(&top, "content"), "ships");
        assert!(ships.dir().is_complete());
        assert_eq!(ships.dir().entry_names(), vec!["flagship.txt"]);

        // Implicit directory has no stored metadata.
        let attr = top.handler().stat(&ships, ".").unwrap();
        assert!(attr.is_dir());
        assert_eq!(attr.perm, 0o777);
    }

    #[test]
    fn test_read_and_seek() {
        let top = setup(&[("data.bin", b"0123456789")]);
        let zip = top.handler().clone();

        let mut file = zip.open(&top, "data.bin", OpenFlags::read(), 0).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");

        assert_eq!(file.seek(SeekFrom::End(-2)).unwrap(), 8);
        assert_eq!(file.read(&mut buf).unwrap(), 2);
        assert_eq!(file.seek(SeekFrom::Current(-100)).unwrap(), 0);
        assert_eq!(file.seek(SeekFrom::Start(100)).unwrap(), 10);
        assert_eq!(file.fstat().unwrap().size, 10);
        assert_eq!(zip.stat(&top, "data.bin").unwrap().size, 10);
    }

    #[test]
    fn test_write_open_refused() {
        let top = setup(&[("a", b"x")]);
        let err = match top.handler().open(&top, "a", OpenFlags::write(), 0) {
            Err(e) => e,
            Ok(_) => panic!("write open on a zip succeeded"),
        };
        assert_eq!(err.kind(), crate::error::VfsErrorKind::PermissionDenied);
        let err = match top.handler().open(&top, "missing", OpenFlags::read(), 0) {
            Err(e) => e,
            Ok(_) => panic!("opened a missing entry"),
        };
        assert!(err.is_not_found());
    }

    #[test]
    fn test_read_write_mount_refused() {
        let (source, _) = mem_handle(build_zip(&[("a", b"x")]));
        let err = match ZipFs::new().mount(Some(source), MountFlags::read_write()) {
            Err(e) => e,
            Ok(_) => panic!("read-write zip mount succeeded"),
        };
        assert_eq!(err.kind(), crate::error::VfsErrorKind::PermissionDenied);
    }

    #[test]
    fn test_invalid_entries_skipped() {
        let top = setup(&[
            ("ok.txt", b"1"),
            ("clash", b"file"),
            ("clash/inner.txt", b"2"),
            ("../escape.txt", b"3"),
        ]);
        assert_eq!(top.dir().entry_names(), vec!["clash", "ok.txt"]);
        assert!(!top.get_entry("clash").unwrap().unwrap().is_dir());
    }

    #[test]
    fn test_entry_components() {
        assert_eq!(entry_components("a/b/"), Some((vec!["a", "b"], true)));
        assert_eq!(entry_components("a/b"), Some((vec!["a", "b"], false)));
        assert!(entry_components("").is_none());
        assert!(entry_components("a//b").is_none());
        assert!(entry_components("./a").is_none());
        assert!(entry_components("/abs").is_none());
    }

    #[test]
    fn test_initial_capacity_is_clamped() {
        assert_eq!(initial_capacity(0), 0);
        assert_eq!(initial_capacity(4096), 4096);
        assert_eq!(initial_capacity(u64::MAX), 1 << 20);
    }

    #[test]
    fn test_zip_time() {
        let dt = zip::DateTime::from_date_and_time(2000, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            zip_time(dt),
            SystemTime::UNIX_EPOCH + Duration::from_secs(946_684_800)
        );
        let dt = zip::DateTime::from_date_and_time(1980, 3, 1, 12, 30, 15).unwrap();
        assert_eq!(
            zip_time(dt),
            SystemTime::UNIX_EPOCH + Duration::from_secs(320_761_815)
        );
    }

    #[test]
    fn test_stat_reports_entry_mtime() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let stamp = zip::DateTime::from_date_and_time(2020, 1, 2, 3, 4, 6).unwrap();
        let options = SimpleFileOptions::default().last_modified_time(stamp);
        writer.start_file("dated.txt", options).unwrap();
        writer.write_all(b"x").unwrap();
        let data = writer.finish().unwrap().into_inner();

        let (source, _) = mem_handle(data);
        let handler: Arc<dyn FileSystemHandler> = Arc::new(ZipFs::new());
        let tree = handler.mount(Some(source), MountFlags::read_only()).unwrap();
        let root = PRoot::new(FileSystemId::ZIP, handler, MountFlags::read_only(), tree, None);
        let top = root.root_dir_handle().unwrap();

        let attr = top.handler().stat(&top, "dated.txt").unwrap();
        assert_eq!(attr.mtime, SystemTime::UNIX_EPOCH + Duration::from_secs(1_577_934_246));
    }
}
