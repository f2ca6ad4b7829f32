//! Filesystem monitoring
//!
//! This module turns native notifications for a directory tree into batches of
//! [`Event`](crate::event::Event)s:
//! - [`source`] wraps the platform watcher
//! - [`walker`] and [`tracker`] keep a watch on every directory in the tree
//! - [`batcher`] groups bursts of events
//! - [`watcher`] runs all of the above in one task

pub mod batcher;
pub mod source;
pub mod tracker;
pub mod walker;
pub mod watcher;

pub use batcher::{DEFAULT_HANDLER_DELAY, EventBatcher};
pub use source::{NativeWatch, RawEventSource, RawStreams, translate};
pub use tracker::{DirectoryTracker, WatchSet};
pub use walker::{DirectoryWalker, MAX_WALK_WORKERS, WalkResult, should_ignore_name};
pub use watcher::{DEFAULT_POLL_INTERVAL, FileWatcher, WatchStreams, WatcherConfig, validate_root};
