//! Merged directory listings.

use tracing::{instrument, warn};

use crate::error::{VfsError, VfsResult};
use crate::fstypes::EntryBuffer;
use crate::io::DirHandle;
use crate::pattern::{MatchType, Matcher};
use crate::physical::PDirHandle;
use crate::resolve::get_path_physical_dirs;

/// Bytes per batch of names read from a backend. Holds roughly a hundred
/// names of average length.
const DIR_BUFFER_SIZE: usize = 2048;

/// Sorted names of a virtual directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirList {
    names: Vec<String>,
}

impl DirList {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn into_names(self) -> Vec<String> {
        self.names
    }
}

impl IntoIterator for DirList {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.names.into_iter()
    }
}

/// Read all names of one physical directory in bounded batches. A backend
/// that cannot list the directory contributes nothing.
fn collect_entries(dir: &PDirHandle, matcher: &Matcher, out: &mut Vec<String>) {
    let mut entries = match dir.handler().open_entries(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "cannot list physical directory");
            return;
        }
    };

    let mut buf = EntryBuffer::new(DIR_BUFFER_SIZE);
    loop {
        let added = match entries.read_entries(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "reading directory entries failed");
                break;
            }
        };
        out.extend(buf.drain().into_iter().filter(|name| matcher.matches(name)));
        if buf.is_finished() {
            break;
        }
        if added == 0 {
            warn!(
                buffer = DIR_BUFFER_SIZE,
                "directory buffer too small to hold a single entry"
            );
            break;
        }
    }
}

impl DirHandle {
    /// Names in the virtual directory `path` that match `pattern`, merged
    /// over every layer, sorted and without duplicates.
    #[instrument(skip(self), fields(dir = %self.path()))]
    pub fn get_dir_list(
        &self,
        path: &str,
        pattern: &str,
        match_type: MatchType,
    ) -> VfsResult<DirList> {
        let dirs = get_path_physical_dirs(self, path)?;
        if dirs.is_empty() {
            return Ok(DirList::default());
        }

        let matcher = Matcher::new(pattern, match_type)
            .map_err(|e| VfsError::corrupt(format!("bad listing pattern: {e}")))?;

        let mut names = Vec::new();
        for loc in &dirs {
            collect_entries(&loc.pdir, &matcher, &mut names);
        }
        names.sort_unstable();
        if dirs.len() > 1 {
            names.dedup();
        }
        Ok(DirList { names })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Uio;
    use crate::error::VfsErrorKind;
    use crate::fstypes::{EntriesIter, FileSystemId};
    use crate::repository::MountRequest;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (DirHandle, TempDir) {
        let tmp = TempDir::new().unwrap();
        for (layer, names) in [("one", ["a.txt", "b.txt"]), ("two", ["b.txt", "c.dat"])] {
            let dir = tmp.path().join(layer);
            fs::create_dir(&dir).unwrap();
            for name in names {
                fs::write(dir.join(name), name).unwrap();
            }
        }
        let repo = Uio::init().open_repository();
        for layer in ["one", "two"] {
            let host = tmp.path().join(layer);
            repo.mount_dir(
                "/",
                MountRequest::new(FileSystemId::STDIO)
                    .in_path(host.to_str().unwrap())
                    .read_only(true),
            )
            .unwrap();
        }
        (repo.open_dir("/", false).unwrap(), tmp)
    }

    #[test]
    fn test_union_is_sorted_and_deduplicated() {
        let (top, _tmp) = setup();
        let list = top.get_dir_list("", "", MatchType::Prefix).unwrap();
        assert_eq!(list.names(), ["a.txt", "b.txt", "c.dat"]);
    }

    #[test]
    fn test_pattern_filters() {
        let (top, _tmp) = setup();
        let list = top.get_dir_list("/", "*.txt", MatchType::Glob).unwrap();
        assert_eq!(list.into_names(), vec!["a.txt", "b.txt"]);

        let list = top.get_dir_list("/", r"\.dat$", MatchType::Regex).unwrap();
        assert_eq!(list.len(), 1);

        let err = top.get_dir_list("/", "(", MatchType::Regex).unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::Io);
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let (top, _tmp) = setup();
        assert!(top.get_dir_list("nowhere", "", MatchType::Prefix).unwrap().is_empty());
    }

    #[test]
    fn test_small_buffer_batches() {
        let names: Vec<String> = (0..500).map(|i| format!("entry-{i:04}")).collect();
        let mut iter = crate::fstypes::NameListEntries::new(names.clone());
        let mut buf = EntryBuffer::new(DIR_BUFFER_SIZE);
        let mut seen = Vec::new();
        let mut batches = 0;
        loop {
            iter.read_entries(&mut buf).unwrap();
            seen.extend(buf.drain());
            batches += 1;
            if buf.is_finished() {
                break;
            }
        }
        assert!(batches > 1);
        assert_eq!(seen, names);
    }
}
