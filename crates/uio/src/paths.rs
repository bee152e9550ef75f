//! Path component utilities.
//!
//! Virtual paths are always `/`-separated. Host paths are decomposed
//! according to a [`PathStyle`]: POSIX paths only know `/`, Windows paths
//! also accept `\`, drive letters (`C:`) and UNC prefixes
//! (`\\server\share`). Consecutive separators collapse into one, except
//! inside the UNC server/share prefix.

use crate::error::{VfsError, VfsResult};

/// How a host path is split into components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    Posix,
    Windows,
}

impl PathStyle {
    /// The style of the platform we are running on.
    pub fn host() -> Self {
        if cfg!(windows) {
            PathStyle::Windows
        } else {
            PathStyle::Posix
        }
    }

    fn is_delimiter(self, c: char) -> bool {
        match self {
            PathStyle::Posix => c == '/',
            PathStyle::Windows => c == '/' || c == '\\',
        }
    }
}

/// A path split into its components.
///
/// For absolute Windows paths the first component may be a drive
/// (`"C:"`) or a UNC root (`"\\server\share"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecomposedPath {
    pub comps: Vec<String>,
    pub absolute: bool,
}

/// Split a host path into components.
///
/// An empty path is `NotFound`, like `open("")`.
pub fn decompose_path(path: &str, style: PathStyle) -> VfsResult<DecomposedPath> {
    if path.is_empty() {
        return Err(VfsError::not_found("empty path"));
    }

    let mut comps = Vec::new();
    let mut absolute = false;
    let mut rest = path;

    if style == PathStyle::Windows {
        if let Some((root, skip)) = unc_server_share(path) {
            comps.push(root);
            absolute = true;
            rest = &path[skip..];
        } else if is_drive_prefix(path) {
            let after = &path[2..];
            if let Some(c) = after.chars().next() {
                if !style.is_delimiter(c) {
                    return Err(VfsError::not_found(path));
                }
            }
            comps.push(path[..2].to_string());
            absolute = true;
            rest = after;
        }
    }

    if !absolute && rest.starts_with(|c| style.is_delimiter(c)) {
        absolute = true;
    }

    comps.extend(
        rest.split(|c| style.is_delimiter(c))
            .filter(|c| !c.is_empty())
            .map(str::to_string),
    );

    Ok(DecomposedPath { comps, absolute })
}

/// Join components back into a `/`-separated path.
///
/// Absolute paths get a leading `/` unless the first component is a
/// drive or UNC root, which carries its own anchor.
pub fn compose_path(path: &DecomposedPath) -> String {
    let mut out = String::new();
    if path.absolute {
        let anchored = path
            .comps
            .first()
            .map(|c| c.starts_with("\\\\") || is_drive_component(c))
            .unwrap_or(false);
        if !anchored {
            out.push('/');
        }
    }
    out.push_str(&path.comps.join("/"));
    out
}

fn is_drive_prefix(path: &str) -> bool {
    let b = path.as_bytes();
    b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
}

fn is_drive_component(comp: &str) -> bool {
    comp.len() == 2 && is_drive_prefix(comp)
}

/// Parse the `\\server\share` prefix of a UNC path.
///
/// Returns the normalised root (`\\server\share`) and the byte offset of
/// the first component after it, trailing delimiters skipped.
pub fn unc_server_share(path: &str) -> Option<(String, usize)> {
    let rest = path.strip_prefix("\\\\")?;
    let server_len = rest.find(['/', '\\'])?;
    if server_len == 0 {
        return None;
    }
    let server = &rest[..server_len];
    let after_server = &rest[server_len + 1..];
    let share_len = after_server.find(['/', '\\']).unwrap_or(after_server.len());
    let share = &after_server[..share_len];

    let mut offset = 2 + server_len + 1 + share_len;
    while path[offset..].starts_with(['/', '\\']) {
        offset += 1;
    }
    Some((format!("\\\\{server}\\{share}"), offset))
}

/// Combine two path parts. The result starts with `/` only when `first`
/// does. `first` may end in `/` or be empty; `second` must not start
/// with `/`.
pub fn join_paths(first: &str, second: &str) -> String {
    if first.is_empty() {
        return second.to_string();
    }
    let first = first.strip_suffix('/').unwrap_or(first);
    format!("{first}/{second}")
}

/// Like [`join_paths`], but the result always starts with `/`.
pub fn join_paths_absolute(first: &str, second: &str) -> String {
    if first.is_empty() {
        return format!("/{second}");
    }
    let first = first.strip_suffix('/').unwrap_or(first);
    format!("/{first}/{second}")
}

/// Returns false if any component is empty, `.` or `..`.
///
/// The empty path is valid (it names the root).
pub fn valid_path_name(path: &str) -> bool {
    if path.is_empty() {
        return true;
    }
    path.split('/').all(|c| !c.is_empty() && c != "." && c != "..")
}

/// Split a virtual path into its non-empty components.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Split `path` at its last `/` into (dir, name).
///
/// Without a `/` the directory part is empty.
pub fn split_last(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

/// Turn backslashes into slashes.
pub fn dos_to_unix_path(path: &str) -> String {
    path.replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decompose_posix() {
        let p = decompose_path("/usr//local/./bin/", PathStyle::Posix).unwrap();
        assert!(p.absolute);
        assert_eq!(p.comps, vec!["usr", "local", ".", "bin"]);

        let p = decompose_path("a/b", PathStyle::Posix).unwrap();
        assert!(!p.absolute);
        assert_eq!(compose_path(&p), "a/b");
    }

    #[test]
    fn test_decompose_empty_is_not_found() {
        let err = decompose_path("", PathStyle::Posix).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_backslash_is_plain_on_posix() {
        let p = decompose_path("a\\b", PathStyle::Posix).unwrap();
        assert_eq!(p.comps, vec!["a\\b"]);
    }

    #[test]
    fn test_decompose_drive_letter() {
        let p = decompose_path("C:\\games\\uqm", PathStyle::Windows).unwrap();
        assert!(p.absolute);
        assert_eq!(p.comps, vec!["C:", "games", "uqm"]);
        assert_eq!(compose_path(&p), "C:/games/uqm");

        assert!(decompose_path("C:games", PathStyle::Windows).is_err());
    }

    #[test]
    fn test_decompose_unc() {
        let p = decompose_path("\\\\server\\share\\\\dir/file", PathStyle::Windows).unwrap();
        assert!(p.absolute);
        assert_eq!(p.comps, vec!["\\\\server\\share", "dir", "file"]);
        assert_eq!(compose_path(&p), "\\\\server\\share/dir/file");
    }

    #[test]
    fn test_unc_requires_server_and_share_separator() {
        assert!(unc_server_share("\\\\server").is_none());
        assert!(unc_server_share("\\\\\\share").is_none());
        assert!(unc_server_share("/not/unc").is_none());
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("", "b"), "b");
        assert_eq!(join_paths("a/", "b"), "a/b");
        assert_eq!(join_paths("/a", "b"), "/a/b");
        assert_eq!(join_paths_absolute("", "b"), "/b");
        assert_eq!(join_paths_absolute("a", "b"), "/a/b");
        assert_eq!(join_paths_absolute("a/", ""), "/a/");
    }

    #[test]
    fn test_valid_path_name() {
        assert!(valid_path_name(""));
        assert!(valid_path_name("a/b"));
        assert!(!valid_path_name("a//b"));
        assert!(!valid_path_name("a/./b"));
        assert!(!valid_path_name("../b"));
        assert!(!valid_path_name("a/"));
    }

    #[test]
    fn test_split_last() {
        assert_eq!(split_last("a/b/c"), ("a/b", "c"));
        assert_eq!(split_last("c"), ("", "c"));
        assert_eq!(split_last("a/"), ("a", ""));
    }
}
