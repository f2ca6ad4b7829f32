//! Built-in exclusions for software projects
//!
//! Version control metadata, dependency caches, virtual environments and build
//! output change constantly while someone works on a project and are almost
//! never interesting to watchers. [`apply_dev_filter`] drops them.

use super::{EventFilter, PathPattern, normalize_path};
use once_cell::sync::Lazy;
use std::path::Path;
use tracing::{debug, info};

/// File name patterns added to the exclude set
pub const DEV_EXCLUDE_PATTERNS: &[&str] = &[
    // editors
    "*.swp", "*.swo", "*~", "*.iml", "*.sublime-workspace",
    // compiled artifacts
    "*.pyc", "*.pyo", "*.pyd", "*.class", "*.o", "*.obj", "*.so", "*.dll", "*.exe", "*.rs.bk",
    // logs and scratch files
    "*.log", "*.tmp", "*.temp", ".eslintcache", ".stylelintcache",
    // os metadata
    ".DS_Store", ".AppleDouble", "Thumbs.db", "ehthumbs.db", "Desktop.ini",
    // lock files
    "package-lock.json", "yarn.lock", "pnpm-lock.yaml", "poetry.lock", "composer.lock", "Cargo.lock",
];

/// Directory names whose whole subtree is excluded
pub const DEV_EXCLUDE_DIRS: &[&str] = &[
    ".git", ".hg", ".svn", ".bzr",
    ".idea", ".vscode", ".vs",
    "node_modules", "bower_components", ".npm", ".yarn", ".next", ".nuxt", ".parcel-cache",
    "venv", ".venv", "env", "virtualenv", "site-packages", "dist-packages",
    "__pycache__", ".pytest_cache", ".mypy_cache", ".ruff_cache", ".tox", ".nox", ".hypothesis",
    ".ipynb_checkpoints", "htmlcov", ".nyc_output",
    "build", "dist", "target", "out", "obj", ".gradle", "DerivedData", ".cache",
];

/// Directory name globs whose whole subtree is excluded
const DEV_EXCLUDE_DIR_GLOBS: &[&str] = &["*.egg-info"];

/// Files and directories that mark a directory as a project root
const PROJECT_MARKERS: &[&str] = &[
    ".git", ".hg", ".svn", ".bzr",
    "package.json", "composer.json", "Gemfile", "requirements.txt", "Cargo.toml", "go.mod",
    "pom.xml", "build.gradle", "setup.py", "pyproject.toml", "Pipfile", "Makefile",
];

const PROJECT_MARKER_EXTENSIONS: &[&str] = &["csproj", "sln"];

static FILE_PATTERNS: Lazy<Vec<PathPattern>> =
    Lazy::new(|| DEV_EXCLUDE_PATTERNS.iter().map(|p| PathPattern::new(*p)).collect());

static DIR_GLOBS: Lazy<Vec<PathPattern>> =
    Lazy::new(|| DEV_EXCLUDE_DIR_GLOBS.iter().map(|p| PathPattern::new(*p)).collect());

/// Check whether a path lies in an excluded directory or names an excluded file.
///
/// Every segment except the last is treated as a directory name; the last one
/// is checked against the file patterns.
pub fn should_exclude_path(path: &Path) -> bool {
    let normalized = normalize_path(path);
    let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
    let Some((file_name, dirs)) = segments.split_last() else {
        return false;
    };

    if let Some(dir) = dirs.iter().find(|dir| is_excluded_dir(dir)) {
        debug!("Dev filter excluded {} (directory {})", normalized, dir);
        return true;
    }

    if FILE_PATTERNS.iter().any(|p| p.matches(file_name)) {
        debug!("Dev filter excluded {} (file pattern)", normalized);
        return true;
    }

    false
}

fn is_excluded_dir(name: &str) -> bool {
    DEV_EXCLUDE_DIRS.contains(&name) || DIR_GLOBS.iter().any(|p| p.matches(name))
}

/// Check whether `root` looks like the top of a software project
pub fn is_dev_project(root: &Path) -> bool {
    if PROJECT_MARKERS.iter().any(|marker| root.join(marker).exists()) {
        return true;
    }

    std::fs::read_dir(root)
        .map(|entries| {
            entries.flatten().any(|entry| {
                entry
                    .path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| PROJECT_MARKER_EXTENSIONS.contains(&ext))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Add the development exclusions to `filter`.
///
/// File patterns join the exclude set. Directories are rejected by a predicate
/// that only looks at the part of the path below `root`, so watching a tree that
/// itself lives under e.g. `build/` still works.
pub fn apply_dev_filter(filter: &mut EventFilter, root: &Path) {
    if is_dev_project(root) {
        info!("Development project detected at {}, applying dev filter", root.display());
    } else {
        debug!("Applying dev filter to {}", root.display());
    }

    filter.add_exclude_patterns(DEV_EXCLUDE_PATTERNS.iter().copied());

    let root = root.to_path_buf();
    filter.add_predicate(move |path, _is_dir| {
        let relative = path.strip_prefix(&root).unwrap_or(path);
        !should_exclude_path(relative)
    });
}
