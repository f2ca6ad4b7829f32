//! Native filesystem notifications
//!
//! [`RawEventSource`] owns the platform watcher from `notify` and exposes just
//! the two operations the tracker needs, adding and removing a single
//! non-recursive directory watch. Notifications are translated into [`Event`]s
//! and delivered on a channel; native errors get their own channel.

use crate::error::BlinkError;
use crate::event::{Event, Operation};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::trace;

/// Registration of single-directory watches
pub trait NativeWatch: Send + Sync {
    fn add(&self, dir: &Path) -> notify::Result<()>;
    fn remove(&self, dir: &Path) -> notify::Result<()>;
}

/// Receivers for translated events and native errors
pub struct RawStreams {
    pub events: mpsc::UnboundedReceiver<Event>,
    pub errors: mpsc::UnboundedReceiver<notify::Error>,
}

/// Thin wrapper around the platform watcher
pub struct RawEventSource {
    watcher: Mutex<RecommendedWatcher>,
}

impl RawEventSource {
    /// Create the platform watcher.
    ///
    /// Fails when the native notification facility is unavailable, e.g. when
    /// the inotify instance limit is exhausted.
    pub fn new() -> Result<(Self, RawStreams), BlinkError> {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::unbounded_channel();

        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(native) => {
                    for event in translate(native) {
                        if event_tx.send(event).is_err() {
                            trace!("Event receiver dropped");
                            return;
                        }
                    }
                }
                Err(e) => {
                    if error_tx.send(e).is_err() {
                        trace!("Error receiver dropped");
                    }
                }
            }
        })?;

        Ok((
            Self {
                watcher: Mutex::new(watcher),
            },
            RawStreams { events, errors },
        ))
    }
}

impl NativeWatch for RawEventSource {
    fn add(&self, dir: &Path) -> notify::Result<()> {
        self.watcher.lock().watch(dir, RecursiveMode::NonRecursive)
    }

    fn remove(&self, dir: &Path) -> notify::Result<()> {
        self.watcher.lock().unwatch(dir)
    }
}

/// Translate one native notification into events, one per path.
///
/// The operation is taken from what the platform reported. A rename reports
/// the old name as `RENAME` and the new name as `CREATE`; some platforms report
/// a deletion as a rename and that is passed through unchanged. Access
/// notifications are dropped.
pub fn translate(native: notify::Event) -> Vec<Event> {
    let now = SystemTime::now();
    match native.kind {
        EventKind::Create(_) => stamp(&native.paths, Operation::CREATE, now),
        EventKind::Remove(_) => stamp(&native.paths, Operation::REMOVE, now),
        EventKind::Modify(ModifyKind::Metadata(_)) => stamp(&native.paths, Operation::CHMOD, now),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            stamp(&native.paths, Operation::CREATE, now)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match native.paths.split_first() {
            Some((from, to)) => {
                let mut events = vec![Event::at(from.clone(), Operation::RENAME, now)];
                events.extend(stamp(to, Operation::CREATE, now));
                events
            }
            None => Vec::new(),
        },
        EventKind::Modify(ModifyKind::Name(_)) => stamp(&native.paths, Operation::RENAME, now),
        EventKind::Modify(_) => stamp(&native.paths, Operation::WRITE, now),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

fn stamp(paths: &[PathBuf], op: Operation, time: SystemTime) -> Vec<Event> {
    paths.iter().map(|path| Event::at(path.clone(), op, time)).collect()
}
