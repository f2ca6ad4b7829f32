//! Event filtering by path pattern and operation type
//!
//! [`EventFilter::should_process`] is a pure decision on a single event. Checks
//! run in a fixed order and the first rejection wins:
//!
//! 1. custom predicates, in registration order
//! 2. exclude patterns, then include patterns (if any were given)
//! 3. ignored operations, then included operations (if any were given)

pub mod dev;
pub mod pattern;

pub use dev::{apply_dev_filter, is_dev_project, should_exclude_path};
pub use pattern::{PathPattern, normalize_path, parse_patterns};

use crate::event::{Event, Operation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Custom predicate called with the event path and whether it is a directory.
/// Returning `false` rejects the event.
pub type PathPredicate = Arc<dyn Fn(&Path, bool) -> bool + Send + Sync>;

/// Serializable filter settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Only paths matching one of these are processed (empty means all)
    pub include: Vec<String>,
    /// Paths matching any of these are dropped
    pub exclude: Vec<String>,
    /// Only these operations are processed (empty means all)
    pub events: Vec<String>,
    /// These operations are always dropped
    pub ignore: Vec<String>,
    /// Add the built-in development exclusions
    pub filter_dev: bool,
}

/// Decides which events reach the broadcasters and the webhook
#[derive(Clone, Default)]
pub struct EventFilter {
    include: Vec<PathPattern>,
    exclude: Vec<PathPattern>,
    include_ops: Operation,
    ignore_ops: Operation,
    predicates: Vec<PathPredicate>,
}

impl EventFilter {
    /// Create a filter that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter from config, including the development exclusions for
    /// `root` when enabled
    pub fn from_config(config: &FilterConfig, root: &Path) -> Self {
        let mut filter = Self::new();
        filter.set_include_patterns(&config.include.join(","));
        filter.set_exclude_patterns(&config.exclude.join(","));
        filter.set_include_operations(Operation::from_names(&config.events));
        filter.set_ignore_operations(Operation::from_names(&config.ignore));
        if config.filter_dev {
            apply_dev_filter(&mut filter, root);
        }
        filter
    }

    /// Replace the include patterns with a comma separated list
    pub fn set_include_patterns(&mut self, patterns: &str) {
        self.include = parse_patterns(patterns).into_iter().map(PathPattern::new).collect();
    }

    /// Replace the exclude patterns with a comma separated list
    pub fn set_exclude_patterns(&mut self, patterns: &str) {
        self.exclude = parse_patterns(patterns).into_iter().map(PathPattern::new).collect();
    }

    pub fn add_exclude_patterns<I, S>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(patterns.into_iter().map(PathPattern::new));
    }

    pub fn set_include_operations(&mut self, ops: Operation) {
        self.include_ops = ops;
    }

    pub fn set_ignore_operations(&mut self, ops: Operation) {
        self.ignore_ops = ops;
    }

    /// Register a predicate; predicates run before every other check
    pub fn add_predicate<F>(&mut self, predicate: F)
    where
        F: Fn(&Path, bool) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
    }

    pub fn include_patterns(&self) -> Vec<&str> {
        self.include.iter().map(PathPattern::as_str).collect()
    }

    pub fn exclude_patterns(&self) -> Vec<&str> {
        self.exclude.iter().map(PathPattern::as_str).collect()
    }

    pub fn predicate_count(&self) -> usize {
        self.predicates.len()
    }

    /// Pattern part of the decision: excludes first, then includes
    pub fn should_include_path(&self, path: &Path) -> bool {
        let normalized = normalize_path(path);

        if let Some(pattern) = self.exclude.iter().find(|p| p.matches(&normalized)) {
            debug!("Path excluded: {} (pattern: {})", normalized, pattern.as_str());
            return false;
        }

        if self.include.is_empty() {
            return true;
        }

        match self.include.iter().find(|p| p.matches(&normalized)) {
            Some(pattern) => {
                debug!("Path included: {} (pattern: {})", normalized, pattern.as_str());
                true
            }
            None => {
                debug!("Path matched no include pattern: {}", normalized);
                false
            }
        }
    }

    /// Operation part of the decision
    pub fn should_include_operation(&self, op: Operation) -> bool {
        if self.ignore_ops.intersects(op) {
            return false;
        }
        self.include_ops.is_empty() || self.include_ops.intersects(op)
    }

    /// Full decision for one event
    pub fn should_process(&self, event: &Event) -> bool {
        let path = event.path();

        if !self.predicates.is_empty() {
            let is_dir = std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false);
            for (i, predicate) in self.predicates.iter().enumerate() {
                if !predicate(path, is_dir) {
                    debug!("Event rejected by predicate {}: {}", i, event);
                    return false;
                }
            }
        }

        if !self.should_include_path(path) {
            return false;
        }

        if !self.should_include_operation(event.operation()) {
            debug!("Event rejected by operation: {}", event);
            return false;
        }

        true
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFilter")
            .field("include", &self.include_patterns())
            .field("exclude", &self.exclude_patterns())
            .field("include_ops", &self.include_ops)
            .field("ignore_ops", &self.ignore_ops)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn filter(include: &str, exclude: &str) -> EventFilter {
        let mut filter = EventFilter::new();
        filter.set_include_patterns(include);
        filter.set_exclude_patterns(exclude);
        filter
    }

    #[test]
    fn test_should_include_path_cases() {
        let cases = [
            ("*.js", "", "project/script.js", true),
            ("*.js", "", "project/style.css", false),
            ("*.js,*.css,*.html", "", "project/style.css", true),
            ("", "node_modules", "project/node_modules/package.json", false),
            ("", "node_modules,*.tmp", "project/file.tmp", false),
            ("*.js", "node_modules", "project/script.js", true),
            ("*.js", "node_modules", "project/node_modules/script.js", false),
            ("**/src/**/*.js", "", "project/src/components/Button.js", true),
            ("", "**/node_modules/**", "project/node_modules/package/index.js", false),
            ("src", "", "project/src/file.js", true),
            ("", "test", "project/test/file_test.js", false),
            ("", "", "project/file.js", true),
        ];

        for (include, exclude, path, expected) in cases {
            assert_eq!(
                filter(include, exclude).should_include_path(Path::new(path)),
                expected,
                "include={include:?} exclude={exclude:?} path={path:?}"
            );
        }
    }

    #[test]
    fn test_ignored_operation_wins() {
        let mut filter = EventFilter::new();
        filter.set_include_operations(Operation::WRITE);
        filter.set_ignore_operations(Operation::CHMOD);

        assert!(filter.should_process(&Event::new("/tmp/a", Operation::WRITE)));
        assert!(!filter.should_process(&Event::new("/tmp/a", Operation::CREATE)));
        // any intersecting ignored bit rejects, even alongside an included one
        assert!(!filter.should_process(&Event::new("/tmp/a", Operation::WRITE | Operation::CHMOD)));
    }

    #[test]
    fn test_include_operations_need_one_bit() {
        let mut filter = EventFilter::new();
        filter.set_include_operations(Operation::CREATE | Operation::REMOVE);

        assert!(filter.should_process(&Event::new("/tmp/a", Operation::REMOVE)));
        assert!(filter.should_process(&Event::new("/tmp/a", Operation::CREATE | Operation::WRITE)));
        assert!(!filter.should_process(&Event::new("/tmp/a", Operation::RENAME)));
    }

    #[test]
    fn test_predicates_run_first() {
        let mut filter = filter("*.rs", "");
        filter.add_predicate(|path, _| !path.to_string_lossy().contains("generated"));

        assert!(filter.should_process(&Event::new("/src/lib.rs", Operation::WRITE)));
        assert!(!filter.should_process(&Event::new("/src/generated/lib.rs", Operation::WRITE)));
    }

    #[test]
    fn test_predicate_sees_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut filter = EventFilter::new();
        filter.add_predicate(|_, is_dir| !is_dir);

        assert!(!filter.should_process(&Event::new(dir.path(), Operation::CREATE)));
        assert!(filter.should_process(&Event::new(dir.path().join("missing.txt"), Operation::CREATE)));
    }

    #[test]
    fn test_from_config() {
        let config = FilterConfig {
            include: vec!["*.js".into()],
            exclude: vec!["vendor".into()],
            events: vec!["write".into()],
            ignore: vec![],
            filter_dev: false,
        };
        let filter = EventFilter::from_config(&config, Path::new("/p"));

        assert!(filter.should_process(&Event::new("/p/app.js", Operation::WRITE)));
        assert!(!filter.should_process(&Event::new("/p/vendor/app.js", Operation::WRITE)));
        assert!(!filter.should_process(&Event::new("/p/app.js", Operation::REMOVE)));
        assert!(!filter.should_process(&Event::new("/p/app.css", Operation::WRITE)));
    }

    proptest! {
        #[test]
        fn excluded_paths_are_always_rejected(
            segments in prop::collection::vec("[a-z]{1,8}", 1..5),
            include in prop::sample::select(vec!["", "*.js", "src", "**/*.txt"]),
        ) {
            let path = format!("/root/{}/blocked/file.txt", segments.join("/"));
            let filter = filter(include, "blocked");
            prop_assert!(!filter.should_process(&Event::new(&path, Operation::WRITE)));
        }

        #[test]
        fn empty_include_accepts_unexcluded_paths(
            segments in prop::collection::vec("[a-z]{1,8}", 1..5),
        ) {
            let path = format!("/root/{}", segments.join("/"));
            let filter = filter("", "*.never");
            prop_assert!(filter.should_process(&Event::new(&path, Operation::CREATE)));
        }
    }
}
