//! Keeps native watches in step with the directory tree
//!
//! Native watches are per directory, so a directory created after start-up is
//! invisible until somebody registers it. The tracker does that from two
//! directions: it reacts to `CREATE` events for directories as they arrive,
//! and it re-walks the whole tree on an interval to catch anything the
//! notifications missed.

use crate::event::{Event, Operation};
use crate::monitor::source::NativeWatch;
use crate::monitor::walker::{DirectoryWalker, WalkResult, should_ignore_name};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Watched directories, keyed both by the path they were found under and by
/// canonical identity.
///
/// Native watches belong to the underlying directory, not to the path, so two
/// paths reaching the same directory through a symlink must share one watch.
#[derive(Debug, Default)]
pub struct WatchSet {
    dirs: HashMap<PathBuf, PathBuf>,
    owners: HashMap<PathBuf, PathBuf>,
}

impl WatchSet {
    pub fn contains(&self, dir: &Path) -> bool {
        self.dirs.contains_key(dir)
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.dirs.keys().cloned().collect()
    }

    /// Path holding the watch for the directory with this canonical identity
    pub fn owner_of(&self, identity: &Path) -> Option<&Path> {
        self.owners.get(identity).map(PathBuf::as_path)
    }

    fn insert(&mut self, dir: PathBuf, identity: PathBuf) {
        self.owners.insert(identity.clone(), dir.clone());
        self.dirs.insert(dir, identity);
    }

    fn take(&mut self, dir: &Path) -> bool {
        match self.dirs.remove(dir) {
            Some(identity) => {
                self.owners.remove(&identity);
                true
            }
            None => false,
        }
    }
}

/// Owns the [`WatchSet`] for one root
pub struct DirectoryTracker {
    root: PathBuf,
    native: Arc<dyn NativeWatch>,
    walker: DirectoryWalker,
    watches: Mutex<WatchSet>,
    known_files: Mutex<HashSet<PathBuf>>,
}

impl DirectoryTracker {
    pub fn new(root: impl Into<PathBuf>, native: Arc<dyn NativeWatch>) -> Self {
        Self::with_walker(root, native, DirectoryWalker::new())
    }

    pub fn with_walker(root: impl Into<PathBuf>, native: Arc<dyn NativeWatch>, walker: DirectoryWalker) -> Self {
        Self {
            root: root.into(),
            native,
            walker,
            watches: Mutex::new(WatchSet::default()),
            known_files: Mutex::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Initial walk: register every directory and remember the files that
    /// already exist. Returns the directories now being watched.
    pub fn start(&self) -> Vec<PathBuf> {
        let walk = self.walker.walk(&self.root);
        self.register_all(&walk.directories);
        self.known_files.lock().extend(walk.files);

        let watched = self.watched_directories();
        info!("Watching {} directories under {}", watched.len(), self.root.display());
        watched
    }

    /// Re-walk the tree.
    ///
    /// New directories are registered (including ones whose registration
    /// failed before), vanished ones are released, and every file not seen
    /// before produces a synthetic `CREATE`.
    pub fn poll(&self) -> Vec<Event> {
        let WalkResult { directories, files } = self.walker.walk(&self.root);

        // the walk may reach a watched directory through another path
        let present: HashSet<PathBuf> = directories
            .iter()
            .filter_map(|dir| fs::canonicalize(dir).ok())
            .collect();
        let vanished: Vec<PathBuf> = self
            .watches
            .lock()
            .dirs
            .iter()
            .filter(|(_, identity)| !present.contains(*identity))
            .map(|(dir, _)| dir.clone())
            .collect();
        for dir in vanished {
            self.release(&dir);
        }
        self.register_all(&directories);

        let mut known = self.known_files.lock();
        let current: HashSet<PathBuf> = files.into_iter().collect();
        let mut created: Vec<Event> = current
            .iter()
            .filter(|file| !known.contains(*file))
            .map(|file| Event::new(file.clone(), Operation::CREATE))
            .collect();
        *known = current;
        drop(known);

        created.sort_by(|a, b| a.path().cmp(b.path()));
        if !created.is_empty() {
            debug!("Poll found {} new files", created.len());
        }
        created
    }

    /// Update watches from an incoming event.
    ///
    /// Returns synthetic `CREATE` events for files found inside a directory
    /// that appeared, since they may have been written before its watch existed.
    pub fn handle_event(&self, event: &Event) -> Vec<Event> {
        let op = event.operation();
        let path = event.path();

        if op.intersects(Operation::REMOVE | Operation::RENAME) {
            self.known_files.lock().remove(path);
            self.release_tree(path);
        }

        if !op.is_create() {
            return Vec::new();
        }

        if !path.is_dir() {
            self.known_files.lock().insert(path.to_path_buf());
            return Vec::new();
        }

        let ignored = path
            .file_name()
            .map(|name| should_ignore_name(&name.to_string_lossy()))
            .unwrap_or(false);
        if ignored || !path.starts_with(&self.root) {
            return Vec::new();
        }

        if let Ok(identity) = fs::canonicalize(path) {
            if let Some(owner) = self.watches.lock().owner_of(&identity) {
                trace!("{} is already watched as {}", path.display(), owner.display());
                return Vec::new();
            }
        }

        let walk = self.walker.walk(path);
        self.register_all(&walk.directories);

        let mut known = self.known_files.lock();
        walk.files
            .into_iter()
            .filter(|file| known.insert(file.clone()))
            .map(|file| Event::new(file, Operation::CREATE))
            .collect()
    }

    pub fn is_watched(&self, dir: &Path) -> bool {
        self.watches.lock().contains(dir)
    }

    pub fn watch_count(&self) -> usize {
        self.watches.lock().len()
    }

    pub fn watched_directories(&self) -> Vec<PathBuf> {
        let mut dirs = self.watches.lock().paths();
        dirs.sort();
        dirs
    }

    /// Release every native watch
    pub fn close(&self) {
        let mut watches = self.watches.lock();
        for dir in watches.paths() {
            if watches.take(&dir) {
                if let Err(e) = self.native.remove(&dir) {
                    debug!("Failed to remove watch for {}: {}", dir.display(), e);
                }
            }
        }
        metrics::gauge!("blink_active_watchers").set(0.0);
        debug!("Released all watches under {}", self.root.display());
    }

    fn register_all(&self, dirs: &[PathBuf]) {
        let mut watches = self.watches.lock();
        for dir in dirs {
            if watches.contains(dir) {
                continue;
            }
            let identity = match fs::canonicalize(dir) {
                Ok(identity) => identity,
                Err(e) => {
                    debug!("Cannot resolve {}: {}", dir.display(), e);
                    continue;
                }
            };
            if let Some(owner) = watches.owner_of(&identity) {
                trace!("{} is already watched as {}", dir.display(), owner.display());
                continue;
            }
            match self.native.add(dir) {
                Ok(()) => {
                    debug!("Watching {}", dir.display());
                    watches.insert(dir.clone(), identity);
                }
                Err(e) => warn!("Failed to watch {}: {}", dir.display(), e),
            }
        }
        metrics::gauge!("blink_active_watchers").set(watches.len() as f64);
    }

    /// Release `dir` and every watched directory below it
    fn release_tree(&self, dir: &Path) {
        let below: Vec<PathBuf> = self
            .watches
            .lock()
            .paths()
            .into_iter()
            .filter(|watched| watched.starts_with(dir))
            .collect();
        for watched in below {
            self.release(&watched);
        }
    }

    fn release(&self, dir: &Path) {
        let mut watches = self.watches.lock();
        if watches.take(dir) {
            // the kernel usually drops the watch itself once the directory is gone
            if let Err(e) = self.native.remove(dir) {
                debug!("Failed to remove watch for {}: {}", dir.display(), e);
            }
            debug!("Stopped watching {}", dir.display());
        }
        metrics::gauge!("blink_active_watchers").set(watches.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Records registrations per underlying directory, the way the kernel
    /// does, and can be told to refuse some directories
    #[derive(Default)]
    struct RecordingWatch {
        active: Mutex<HashSet<PathBuf>>,
        refuse: Mutex<HashSet<PathBuf>>,
    }

    fn inode(dir: &Path) -> PathBuf {
        fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf())
    }

    impl NativeWatch for RecordingWatch {
        fn add(&self, dir: &Path) -> notify::Result<()> {
            if self.refuse.lock().contains(dir) {
                return Err(notify::Error::generic("refused"));
            }
            assert!(self.active.lock().insert(inode(dir)), "double watch on {dir:?}");
            Ok(())
        }

        fn remove(&self, dir: &Path) -> notify::Result<()> {
            assert!(self.active.lock().remove(&inode(dir)), "unwatch of unknown {dir:?}");
            Ok(())
        }
    }

    fn tracker(root: &Path) -> (DirectoryTracker, Arc<RecordingWatch>) {
        let native = Arc::new(RecordingWatch::default());
        let tracker = DirectoryTracker::with_walker(root, native.clone(), DirectoryWalker::with_workers(2));
        (tracker, native)
    }

    #[test]
    fn test_start_registers_every_directory() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::create_dir_all(dir.path().join(".hidden")).unwrap();
        fs::write(dir.path().join("a/file.txt"), "x").unwrap();

        let (tracker, native) = tracker(dir.path());
        let watched = tracker.start();

        assert_eq!(watched.len(), 3);
        assert!(tracker.is_watched(dir.path()));
        assert!(tracker.is_watched(&dir.path().join("a/b")));
        assert!(!tracker.is_watched(&dir.path().join(".hidden")));
        assert_eq!(native.active.lock().len(), 3);
    }

    #[test]
    fn test_poll_finds_new_directories_and_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("existing.txt"), "x").unwrap();

        let (tracker, _native) = tracker(dir.path());
        tracker.start();
        assert!(tracker.poll().is_empty());

        fs::create_dir(dir.path().join("late")).unwrap();
        fs::write(dir.path().join("late/new.txt"), "x").unwrap();

        let created = tracker.poll();
        assert!(tracker.is_watched(&dir.path().join("late")));
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].path(), dir.path().join("late/new.txt"));
        assert!(created[0].operation().is_create());

        // already announced
        assert!(tracker.poll().is_empty());
    }

    #[test]
    fn test_poll_retries_failed_registration() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();

        let (tracker, native) = tracker(dir.path());
        native.refuse.lock().insert(sub.clone());
        tracker.start();
        assert!(!tracker.is_watched(&sub));

        native.refuse.lock().clear();
        tracker.poll();
        assert!(tracker.is_watched(&sub));
    }

    #[test]
    fn test_remove_event_releases_subtree() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir_all(sub.join("deeper")).unwrap();

        let (tracker, native) = tracker(dir.path());
        tracker.start();
        assert_eq!(tracker.watch_count(), 3);

        tracker.handle_event(&Event::new(&sub, Operation::REMOVE));
        assert_eq!(tracker.watch_count(), 1);
        assert!(!tracker.is_watched(&sub.join("deeper")));
        assert_eq!(native.active.lock().len(), 1);
    }

    #[test]
    fn test_create_event_for_directory_registers_it() {
        let dir = TempDir::new().unwrap();
        let (tracker, _native) = tracker(dir.path());
        tracker.start();

        let sub = dir.path().join("fresh");
        fs::create_dir_all(sub.join("inner")).unwrap();
        fs::write(sub.join("inner/early.txt"), "x").unwrap();

        let synthetic = tracker.handle_event(&Event::new(&sub, Operation::CREATE));
        assert!(tracker.is_watched(&sub));
        assert!(tracker.is_watched(&sub.join("inner")));
        assert_eq!(synthetic.len(), 1);
        assert_eq!(synthetic[0].path(), sub.join("inner/early.txt"));

        // the poll must not announce the same file again
        assert!(tracker.poll().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directory_shares_the_existing_watch() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("x.txt"), "x").unwrap();

        let (tracker, native) = tracker(dir.path());
        tracker.start();

        let alias = dir.path().join("alias");
        std::os::unix::fs::symlink(&src, &alias).unwrap();
        let synthetic = tracker.handle_event(&Event::new(&alias, Operation::CREATE));
        assert!(synthetic.is_empty());
        assert!(!tracker.is_watched(&alias));

        tracker.poll();
        tracker.poll();
        assert!(tracker.is_watched(&src));
        assert!(!tracker.is_watched(&alias));
        assert_eq!(tracker.watch_count(), 2);
        assert!(native.active.lock().contains(&inode(&src)));
    }

    #[cfg(unix)]
    #[test]
    fn test_register_skips_directories_already_watched_under_another_path() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        let (tracker, native) = tracker(dir.path());
        tracker.start();

        let alias = dir.path().join("alias");
        std::os::unix::fs::symlink(&src, &alias).unwrap();
        tracker.register_all(&[alias.clone()]);

        assert!(!tracker.is_watched(&alias));
        assert_eq!(native.active.lock().len(), 2);
        assert_eq!(
            tracker.watches.lock().owner_of(&inode(&src)),
            Some(src.as_path())
        );
    }

    #[test]
    fn test_close_releases_everything() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        let (tracker, native) = tracker(dir.path());
        tracker.start();

        tracker.close();
        assert_eq!(tracker.watch_count(), 0);
        assert!(native.active.lock().is_empty());
    }
}
