//! Path pattern matching
//!
//! A pattern is tried against a `/`-separated path in several ways, and any
//! successful one counts as a match:
//!
//! 1. as a glob against the base name,
//! 2. for patterns containing `**`, every `**`-delimited fragment must occur in
//!    the path in order,
//! 3. for patterns containing `*`, as a glob against the whole path and then
//!    against each path segment,
//! 4. for patterns without `*`, as a plain substring.
//!
//! Globs are segment local: `*` never crosses a `/`.

use globset::{GlobBuilder, GlobMatcher};
use std::path::{MAIN_SEPARATOR, Path};
use tracing::debug;

/// A single compiled include or exclude pattern
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    glob: Option<GlobMatcher>,
}

impl PathPattern {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let glob = match GlobBuilder::new(&raw).literal_separator(true).build() {
            Ok(glob) => Some(glob.compile_matcher()),
            Err(e) => {
                debug!("Pattern {:?} is not a valid glob: {}", raw, e);
                None
            }
        };
        Self { raw, glob }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match against a path already normalized with [`normalize_path`]
    pub fn matches(&self, path: &str) -> bool {
        let base = path.rsplit('/').next().unwrap_or(path);
        if self.glob_matches(base) {
            return true;
        }

        if self.raw.contains("**") && fragments_in_order(&self.raw, path) {
            return true;
        }

        if self.raw.contains('*') {
            self.glob_matches(path) || path.split('/').any(|segment| self.glob_matches(segment))
        } else {
            path.contains(self.raw.as_str())
        }
    }

    fn glob_matches(&self, candidate: &str) -> bool {
        self.glob
            .as_ref()
            .map(|glob| glob.is_match(candidate))
            .unwrap_or(false)
    }
}

/// Every non-empty fragment between `**` markers must appear in `path`, in order
fn fragments_in_order(pattern: &str, path: &str) -> bool {
    let mut rest = path;
    for fragment in pattern.split("**").filter(|f| !f.is_empty()) {
        match rest.find(fragment) {
            Some(index) => rest = &rest[index + fragment.len()..],
            None => return false,
        }
    }
    true
}

/// Render a path with `/` separators on every platform
pub fn normalize_path(path: &Path) -> String {
    let path = path.to_string_lossy();
    if MAIN_SEPARATOR == '/' {
        path.into_owned()
    } else {
        path.replace(MAIN_SEPARATOR, "/")
    }
}

/// Split a comma separated pattern list.
///
/// Items are trimmed and empty ones dropped. A leading `**/` also yields the
/// pattern without it (so `**/build` matches a top level `build`), and a
/// trailing `/**` also yields `…/**/*` so files below the directory match.
pub fn parse_patterns(list: &str) -> Vec<String> {
    let mut patterns = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = if MAIN_SEPARATOR == '/' {
            item.to_string()
        } else {
            item.replace(MAIN_SEPARATOR, "/")
        };

        if let Some(stripped) = pattern.strip_prefix("**/") {
            if !stripped.starts_with('*') {
                let stripped = stripped.to_string();
                patterns.push(pattern);
                patterns.push(stripped);
                continue;
            }
        }

        if pattern.ends_with("/**") {
            let expanded = format!("{}/*", pattern);
            patterns.push(pattern);
            patterns.push(expanded);
            continue;
        }

        patterns.push(pattern);
    }
    patterns
}
