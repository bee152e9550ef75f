//! Mounting archives found inside the repository.
//!
//! Two flavours: rule-driven auto-mounting, where a mount carries
//! [`AutoMount`] rules and every matching entry of a directory is mounted
//! as a nested filesystem, and [`mount_dir_zips`], which mounts every zip
//! archive of a directory at a chosen mount point.
//!
//! A failed mount of a single archive is logged and skipped; the others
//! are still mounted.

use tracing::{debug, warn};

use crate::dirlist::DirList;
use crate::error::VfsResult;
use crate::fstypes::FileSystemId;
use crate::io::DirHandle;
use crate::pattern::MatchType;
use crate::repository::{MountHandle, MountRequest, Repository};
use crate::types::{AutoMount, MountLocation};

/// Archive names picked up by [`mount_dir_zips`].
const ZIP_PATTERN: &str = r"(?i)\.(zip|uqm)$";

fn regular_files(dir: &DirHandle, list: DirList) -> Vec<String> {
    list.into_iter()
        .filter(|name| dir.stat(name).map(|attr| attr.is_file()).unwrap_or(false))
        .collect()
}

/// Apply the auto-mount rules of `mount` to the virtual directory `dir`.
///
/// Each regular file matching a rule is mounted at `dir` with the rule's
/// filesystem, directly below `mount`. Returns the new mounts.
pub fn apply_auto_mounts(
    repo: &Repository,
    mount: &MountHandle,
    dir: &DirHandle,
) -> VfsResult<Vec<MountHandle>> {
    let rules: Vec<AutoMount> = mount.info().auto_mount().to_vec();
    let mount_point = dir.path();
    let mut mounted = Vec::new();

    for rule in &rules {
        let list = dir.get_dir_list("", &rule.pattern, rule.match_type)?;
        for name in regular_files(dir, list) {
            let req = MountRequest::new(rule.fs_id)
                .source(dir, &name)
                .read_only(rule.read_only)
                .location(MountLocation::Below(mount));
            match repo.mount_dir(&mount_point, req) {
                Ok(handle) => {
                    debug!(archive = %name, at = %mount_point, "auto-mounted");
                    mounted.push(handle);
                }
                Err(e) => warn!(archive = %name, error = %e, "auto-mount failed"),
            }
        }
    }
    Ok(mounted)
}

/// Mount every `*.zip` and `*.uqm` file (any case) of `dir` read-only at
/// `mount_point`, each at `location`. Returns the new mounts.
pub fn mount_dir_zips(
    dir: &DirHandle,
    mount_point: &str,
    location: MountLocation<&MountHandle>,
) -> VfsResult<Vec<MountHandle>> {
    let repo = dir.repository();
    let list = dir.get_dir_list("", ZIP_PATTERN, MatchType::Regex)?;
    let mut mounted = Vec::new();

    for name in regular_files(dir, list) {
        let req = MountRequest::new(FileSystemId::ZIP)
            .source(dir, &name)
            .read_only(true)
            .location(location);
        match repo.mount_dir(mount_point, req) {
            Ok(handle) => {
                debug!(archive = %name, at = %mount_point, "mounted archive");
                mounted.push(handle);
            }
            Err(e) => warn!(archive = %name, error = %e, "cannot mount archive"),
        }
    }
    Ok(mounted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Uio;
    use std::fs;
    use std::io::{Read, Write};
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &std::path::Path, entries: &[(&str, &[u8])]) {
        let mut writer = zip::ZipWriter::new(fs::File::create(path).unwrap());
        for (name, contents) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap();
    }

    fn setup() -> (Repository, TempDir) {
        let tmp = TempDir::new().unwrap();
        let content = tmp.path().join("content");
        fs::create_dir(&content).unwrap();
        write_zip(&content.join("base.zip"), &[("base.txt", b"from base")]);
        write_zip(&content.join("ADDON.UQM"), &[("addon.txt", b"from addon")]);
        fs::write(content.join("readme.txt"), "not an archive").unwrap();
        fs::create_dir(content.join("fake.zip")).unwrap();
        (Uio::init().open_repository(), tmp)
    }

    fn read_all(dir: &DirHandle, path: &str) -> String {
        let mut stream = dir.fopen(path, "r").unwrap();
        let mut buf = vec![0u8; 64];
        let n = stream.fread(&mut buf, 1, 64);
        buf.truncate(n);
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_mount_dir_zips() {
        let (repo, tmp) = setup();
        let host = tmp.path().join("content");
        repo.mount_dir(
            "/content",
            MountRequest::new(FileSystemId::STDIO)
                .in_path(host.to_str().unwrap())
                .read_only(true),
        )
        .unwrap();
        let content = repo.open_dir("/content", false).unwrap();

        let mounted = mount_dir_zips(&content, "/", MountLocation::Top).unwrap();
        assert_eq!(mounted.len(), 2);
        assert!(mounted.iter().all(|m| m.info().is_read_only()));

        let top = repo.open_dir("/", false).unwrap();
        assert_eq!(read_all(&top, "base.txt"), "from base");
        assert_eq!(read_all(&top, "addon.txt"), "from addon");
    }

    #[test]
    fn test_apply_auto_mounts() {
        let (repo, tmp) = setup();
        let host = tmp.path().join("content");
        let rules = vec![AutoMount {
            pattern: "*.zip".to_string(),
            match_type: MatchType::Glob,
            fs_id: FileSystemId::ZIP,
            read_only: true,
        }];
        let base = repo
            .mount_dir(
                "/",
                MountRequest::new(FileSystemId::STDIO)
                    .in_path(host.to_str().unwrap())
                    .auto_mount(rules)
                    .read_only(true),
            )
            .unwrap();
        let top = repo.open_dir("/", false).unwrap();

        let mounted = apply_auto_mounts(&repo, &base, &top).unwrap();
        assert_eq!(mounted.len(), 1);
        let order: Vec<_> = repo.mounts().iter().map(MountHandle::id).collect();
        assert_eq!(order, vec![base.id(), mounted[0].id()]);

        let mut handle = top.fopen("base.txt", "r").unwrap();
        let mut buf = [0u8; 9];
        assert_eq!(handle.fread(&mut buf, 9, 1), 1);
        assert_eq!(&buf, b"from base");
        let mut host_copy = String::new();
        fs::File::open(host.join("readme.txt"))
            .unwrap()
            .read_to_string(&mut host_copy)
            .unwrap();
        assert_eq!(read_all(&top, "readme.txt"), host_copy);
    }
}
