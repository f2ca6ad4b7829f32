//! The watch pump: native events, directory polling and batching in one task

use crate::error::BlinkError;
use crate::event::Event;
use crate::monitor::batcher::{DEFAULT_HANDLER_DELAY, EventBatcher};
use crate::monitor::source::{RawEventSource, RawStreams};
use crate::monitor::tracker::DirectoryTracker;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default interval between directory re-walks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(4);

/// Configuration for the file watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub root: PathBuf,
    pub handler_delay: Duration,
    pub poll_interval: Duration,
}

impl WatcherConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handler_delay: DEFAULT_HANDLER_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Output of a running watcher
pub struct WatchStreams {
    /// Batches of events, flushed after each quiet period
    pub batches: mpsc::UnboundedReceiver<Vec<Event>>,
    /// Errors reported by the native notification layer
    pub errors: mpsc::UnboundedReceiver<notify::Error>,
}

/// Watches one directory tree
pub struct FileWatcher {
    config: WatcherConfig,
    tracker: Arc<DirectoryTracker>,
    raw: RawStreams,
}

impl FileWatcher {
    /// Check the root and set up native notifications.
    ///
    /// Fails if the root is missing, is not a directory, or the platform
    /// watcher cannot be created. Nothing is running until [`FileWatcher::start`].
    pub fn new(config: WatcherConfig) -> Result<Self, BlinkError> {
        let root = validate_root(&config.root)?;
        let (source, raw) = RawEventSource::new()?;
        let tracker = Arc::new(DirectoryTracker::new(root.clone(), Arc::new(source)));

        Ok(Self {
            config: WatcherConfig { root, ..config },
            tracker,
            raw,
        })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Shared handle to the tracker, mainly for inspecting the watch set
    pub fn tracker(&self) -> Arc<DirectoryTracker> {
        self.tracker.clone()
    }

    /// Walk the tree, register watches and spawn the pump.
    ///
    /// The pump runs until `shutdown` is cancelled, then releases every watch.
    pub async fn start(self, shutdown: CancellationToken) -> Result<WatchStreams, BlinkError> {
        let FileWatcher { config, tracker, raw } = self;
        let RawStreams { events: mut raw_events, errors: mut raw_errors } = raw;

        let initial = tracker.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || initial.start()).await {
            warn!("Initial directory walk failed: {}", e);
        }

        let (batcher, batches) = EventBatcher::new(config.handler_delay);
        let (error_tx, errors) = mpsc::unbounded_channel();

        info!(
            "Watching {} (handler delay {:?}, poll interval {:?})",
            config.root.display(),
            batcher.delay(),
            config.poll_interval
        );

        tokio::spawn(async move {
            let mut poll = interval(config.poll_interval.max(Duration::from_millis(10)));
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately and the initial walk just ran
            poll.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        debug!("Watch pump shutting down");
                        break;
                    }
                    Some(event) = raw_events.recv() => {
                        let synthetic = if event.operation().is_create() {
                            let tracker = tracker.clone();
                            let created = event.clone();
                            tokio::task::spawn_blocking(move || tracker.handle_event(&created))
                                .await
                                .unwrap_or_default()
                        } else {
                            tracker.handle_event(&event)
                        };
                        batcher.add(event);
                        batcher.add_batch(synthetic);
                    }
                    Some(err) = raw_errors.recv() => {
                        if error_tx.send(err).is_err() {
                            debug!("Watch error receiver dropped");
                        }
                    }
                    _ = poll.tick() => {
                        let tracker = tracker.clone();
                        match tokio::task::spawn_blocking(move || tracker.poll()).await {
                            Ok(created) => batcher.add_batch(created),
                            Err(e) => warn!("Directory poll failed: {}", e),
                        }
                    }
                }
            }

            let tracker = tracker.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || tracker.close()).await {
                warn!("Failed to release watches: {}", e);
            }
        });

        Ok(WatchStreams { batches, errors })
    }
}

/// Resolve the root to an absolute, canonical directory path
pub fn validate_root(root: &Path) -> Result<PathBuf, BlinkError> {
    let metadata = std::fs::metadata(root).map_err(|_| BlinkError::RootMissing {
        path: root.to_path_buf(),
    })?;
    if !metadata.is_dir() {
        return Err(BlinkError::NotADirectory {
            path: root.to_path_buf(),
        });
    }
    std::fs::canonicalize(root).map_err(|_| BlinkError::RootMissing {
        path: root.to_path_buf(),
    })
}
