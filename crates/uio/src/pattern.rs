//! Name matching for directory listings and auto-mount rules.

use serde::{Deserialize, Serialize};

use crate::error::{VfsError, VfsResult};

/// How a pattern is interpreted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MatchType {
    /// Whole-name equality.
    Literal,
    /// Name starts with the pattern.
    Prefix,
    /// Name ends with the pattern.
    Suffix,
    /// Pattern occurs anywhere in the name.
    Substring,
    /// Shell-style wildcard (`*`, `?`, `[...]`).
    Glob,
    /// Unanchored regular expression search.
    Regex,
}

/// A compiled pattern.
#[derive(Debug, Clone)]
pub enum Matcher {
    Literal(String),
    Prefix(String),
    Suffix(String),
    Substring(String),
    Glob(glob::Pattern),
    Regex(regex::Regex),
}

impl Matcher {
    /// Compile `pattern` for the given match type.
    ///
    /// A malformed glob or regex is reported as `InvalidArgument`.
    pub fn new(pattern: &str, match_type: MatchType) -> VfsResult<Self> {
        Ok(match match_type {
            MatchType::Literal => Matcher::Literal(pattern.to_string()),
            MatchType::Prefix => Matcher::Prefix(pattern.to_string()),
            MatchType::Suffix => Matcher::Suffix(pattern.to_string()),
            MatchType::Substring => Matcher::Substring(pattern.to_string()),
            MatchType::Glob => Matcher::Glob(
                glob::Pattern::new(pattern)
                    .map_err(|e| VfsError::invalid_argument(format!("glob '{pattern}': {e}")))?,
            ),
            MatchType::Regex => Matcher::Regex(
                regex::Regex::new(pattern)
                    .map_err(|e| VfsError::invalid_argument(format!("regex '{pattern}': {e}")))?,
            ),
        })
    }

    /// Test a name against the pattern.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Matcher::Literal(p) => name == p,
            Matcher::Prefix(p) => name.starts_with(p.as_str()),
            Matcher::Suffix(p) => name.ends_with(p.as_str()),
            Matcher::Substring(p) => name.contains(p.as_str()),
            Matcher::Glob(p) => p.matches(name),
            Matcher::Regex(r) => r.is_match(name),
        }
    }
}
