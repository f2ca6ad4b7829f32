//! Fan-out over several adapters

use crate::broadcast::{BroadcastError, Broadcaster};
use crate::event::Event;
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Forwards every call to each adapter in order.
///
/// A failing adapter does not stop the others from being called; the first
/// error seen is returned once all of them ran.
pub struct CompositeBroadcaster {
    adapters: Vec<Arc<dyn Broadcaster>>,
}

impl CompositeBroadcaster {
    pub fn new(adapters: Vec<Arc<dyn Broadcaster>>) -> Self {
        Self { adapters }
    }

    pub fn adapters(&self) -> &[Arc<dyn Broadcaster>] {
        &self.adapters
    }

    fn each<F>(&self, mut call: F) -> Result<(), BroadcastError>
    where
        F: FnMut(&dyn Broadcaster) -> Result<(), BroadcastError>,
    {
        let mut first = None;
        for adapter in &self.adapters {
            if let Err(e) = call(adapter.as_ref()) {
                warn!("{} adapter failed: {}", adapter.name(), e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Broadcaster for CompositeBroadcaster {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn routes(&self) -> Router {
        self.adapters
            .iter()
            .fold(Router::new(), |router, adapter| router.merge(adapter.routes()))
    }

    fn start(&self, shutdown: &CancellationToken) -> Result<(), BroadcastError> {
        self.each(|adapter| adapter.start(shutdown))
    }

    fn stop(&self) -> Result<(), BroadcastError> {
        self.each(|adapter| adapter.stop())
    }

    fn send(&self, event: &Event) -> Result<(), BroadcastError> {
        self.each(|adapter| adapter.send(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Operation;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        label: &'static str,
        fail: bool,
        sends: AtomicUsize,
        stops: AtomicUsize,
    }

    impl Counting {
        fn new(label: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                label,
                fail,
                sends: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            })
        }

        fn result(&self) -> Result<(), BroadcastError> {
            if self.fail {
                Err(BroadcastError::Adapter {
                    adapter: self.label.to_string(),
                    message: "boom".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    impl Broadcaster for Counting {
        fn name(&self) -> &'static str {
            self.label
        }

        fn routes(&self) -> Router {
            Router::new()
        }

        fn start(&self, _shutdown: &CancellationToken) -> Result<(), BroadcastError> {
            self.result()
        }

        fn stop(&self) -> Result<(), BroadcastError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.result()
        }

        fn send(&self, _event: &Event) -> Result<(), BroadcastError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.result()
        }
    }

    #[test]
    fn test_every_adapter_is_called_and_first_error_wins() {
        let ok = Counting::new("ok", false);
        let first = Counting::new("first", true);
        let second = Counting::new("second", true);
        let composite = CompositeBroadcaster::new(vec![
            first.clone() as Arc<dyn Broadcaster>,
            ok.clone(),
            second.clone(),
        ]);

        let err = composite.send(&Event::new("/w/a", Operation::WRITE)).unwrap_err();
        assert!(matches!(err, BroadcastError::Adapter { ref adapter, .. } if adapter == "first"));
        assert_eq!(first.sends.load(Ordering::SeqCst), 1);
        assert_eq!(ok.sends.load(Ordering::SeqCst), 1);
        assert_eq!(second.sends.load(Ordering::SeqCst), 1);

        assert!(composite.stop().is_err());
        assert_eq!(ok.stops.load(Ordering::SeqCst), 1);
        assert_eq!(second.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_all_ok() {
        let a = Counting::new("a", false);
        let b = Counting::new("b", false);
        let composite = CompositeBroadcaster::new(vec![a.clone() as Arc<dyn Broadcaster>, b.clone()]);

        assert!(composite.start(&CancellationToken::new()).is_ok());
        assert!(composite.send(&Event::new("/w/a", Operation::CREATE)).is_ok());
        assert_eq!(a.sends.load(Ordering::SeqCst) + b.sends.load(Ordering::SeqCst), 2);
    }
}
