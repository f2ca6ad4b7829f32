//! Symlink-following directory walk
//!
//! The walk goes level by level. Each level's directories are listed on a small
//! rayon pool; the listings come back to the caller, which alone decides which
//! subdirectories are new and forms the next level. A directory is visited at
//! most once per walk, identified by its canonical path, so symlink cycles end.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Upper bound on walk threads
pub const MAX_WALK_WORKERS: usize = 8;

/// Directories whose name starts with one of these are skipped with their subtree
const IGNORED_PREFIXES: [char; 2] = ['.', '_'];

/// Check whether a directory name is hidden from the walk
pub fn should_ignore_name(name: &str) -> bool {
    name.starts_with(IGNORED_PREFIXES)
}

/// Everything found by one walk
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WalkResult {
    /// Directories to watch, root first, in the order they were found
    pub directories: Vec<PathBuf>,
    /// Regular files (and symlinks to them) inside those directories
    pub files: Vec<PathBuf>,
}

#[derive(Default)]
struct Listing {
    subdirs: Vec<PathBuf>,
    files: Vec<PathBuf>,
}

/// Walks a tree using a dedicated thread pool
pub struct DirectoryWalker {
    pool: Option<ThreadPool>,
}

impl DirectoryWalker {
    /// Create a walker with `min(available_parallelism, 8)` threads
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_WALK_WORKERS);
        Self::with_workers(workers)
    }

    pub fn with_workers(workers: usize) -> Self {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.clamp(1, MAX_WALK_WORKERS))
            .thread_name(|i| format!("blink-walk-{}", i))
            .build();
        match pool {
            Ok(pool) => Self { pool: Some(pool) },
            Err(e) => {
                warn!("Failed to build walk pool, walking on the calling thread: {}", e);
                Self { pool: None }
            }
        }
    }

    /// Walk `root` and everything below it
    pub fn walk(&self, root: &Path) -> WalkResult {
        let mut result = WalkResult::default();
        let mut visited = HashSet::new();

        let Ok(canonical) = fs::canonicalize(root) else {
            warn!("Cannot resolve walk root: {}", root.display());
            return result;
        };
        visited.insert(canonical);
        result.directories.push(root.to_path_buf());

        let mut frontier = vec![root.to_path_buf()];
        while !frontier.is_empty() {
            let listings = self.list_level(&frontier);
            let mut next = Vec::new();

            for listing in listings {
                result.files.extend(listing.files);
                for dir in listing.subdirs {
                    match fs::canonicalize(&dir) {
                        Ok(identity) => {
                            if visited.insert(identity) {
                                result.directories.push(dir.clone());
                                next.push(dir);
                            } else {
                                trace!("Already visited: {}", dir.display());
                            }
                        }
                        Err(e) => debug!("Cannot resolve {}: {}", dir.display(), e),
                    }
                }
            }

            frontier = next;
        }

        debug!(
            "Walked {}: {} directories, {} files",
            root.display(),
            result.directories.len(),
            result.files.len()
        );
        result
    }

    fn list_level(&self, dirs: &[PathBuf]) -> Vec<Listing> {
        match &self.pool {
            Some(pool) => pool.install(|| dirs.par_iter().map(|dir| list_directory(dir)).collect()),
            None => dirs.iter().map(|dir| list_directory(dir)).collect(),
        }
    }
}

impl Default for DirectoryWalker {
    fn default() -> Self {
        Self::new()
    }
}

/// Read one directory, following symlinks to decide what each entry is
fn list_directory(dir: &Path) -> Listing {
    let mut listing = Listing::default();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Skipping unreadable directory {}: {}", dir.display(), e);
            return listing;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        let is_dir = if file_type.is_symlink() {
            match fs::metadata(&path) {
                Ok(target) => target.is_dir(),
                Err(e) => {
                    debug!("Skipping broken symlink {}: {}", path.display(), e);
                    continue;
                }
            }
        } else {
            file_type.is_dir()
        };

        if is_dir {
            let name = entry.file_name();
            if should_ignore_name(&name.to_string_lossy()) {
                trace!("Skipping ignored directory {}", path.display());
                continue;
            }
            listing.subdirs.push(path);
        } else {
            listing.files.push(path);
        }
    }

    listing
}
