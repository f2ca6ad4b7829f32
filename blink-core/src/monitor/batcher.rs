//! Event batching to absorb bursts of raw notifications

use crate::event::Event;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::trace;

/// Default quiescence delay before a batch is flushed
pub const DEFAULT_HANDLER_DELAY: Duration = Duration::from_millis(100);

/// Collects events and flushes them together
///
/// The first event added after a flush arms a timer; when it fires everything
/// collected so far goes out as one batch. A lone event therefore waits exactly
/// one delay, and a storm of events becomes one batch per delay.
#[derive(Clone)]
pub struct EventBatcher {
    delay: Duration,
    pending: Arc<Mutex<Vec<Event>>>,
    tx: mpsc::UnboundedSender<Vec<Event>>,
}

impl EventBatcher {
    /// Create a batcher and the receiver its batches are delivered to.
    ///
    /// A zero delay is replaced with [`DEFAULT_HANDLER_DELAY`].
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<Vec<Event>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let delay = if delay.is_zero() { DEFAULT_HANDLER_DELAY } else { delay };

        let batcher = Self {
            delay,
            pending: Arc::new(Mutex::new(Vec::new())),
            tx,
        };
        (batcher, rx)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Add one event. Must be called from within a tokio runtime.
    pub fn add(&self, event: Event) {
        let arm = {
            let mut pending = self.pending.lock();
            pending.push(event);
            pending.len() == 1
        };
        if arm {
            self.arm();
        }
    }

    /// Add several events at once, arming the timer only if nothing was pending
    pub fn add_batch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let arm = {
            let mut pending = self.pending.lock();
            let was_empty = pending.is_empty();
            pending.extend(events);
            was_empty
        };
        if arm {
            self.arm();
        }
    }

    /// Number of events waiting for the next flush
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn arm(&self) {
        let pending = self.pending.clone();
        let tx = self.tx.clone();
        let delay = self.delay;

        tokio::spawn(async move {
            sleep(delay).await;
            let batch = std::mem::take(&mut *pending.lock());
            if batch.is_empty() {
                return;
            }
            trace!("Flushing batch of {} events", batch.len());
            if tx.send(batch).is_err() {
                trace!("Batch receiver dropped");
            }
        });
    }
}
