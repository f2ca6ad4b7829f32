//! Server-Sent Events adapter
//!
//! Events are parked in a [`PendingEventMap`] for a short window. Every client
//! connection wakes up once per refresh interval, takes the entries it has not
//! seen yet, collapses them to one per path and writes one frame each.

use crate::broadcast::{BroadcastError, Broadcaster, StreamerOptions};
use crate::event::Event;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::convert::Infallible;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Position of an entry in the pending map
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Arrival {
    at: Instant,
    seq: u64,
}

/// Recently sent events ordered by arrival, forgotten after `max_age`
#[derive(Debug)]
pub struct PendingEventMap {
    entries: BTreeMap<Arrival, Event>,
    max_age: Duration,
    next_seq: u64,
}

impl PendingEventMap {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_age,
            next_seq: 0,
        }
    }

    pub fn insert(&mut self, event: Event) {
        self.insert_at(event, Instant::now());
    }

    pub fn insert_at(&mut self, event: Event, now: Instant) {
        self.purge(now);
        let arrival = Arrival {
            at: now,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(arrival, event);
    }

    /// Drop entries older than `max_age`
    pub fn purge(&mut self, now: Instant) {
        if let Some(cutoff) = now.checked_sub(self.max_age) {
            self.entries = self.entries.split_off(&Arrival { at: cutoff, seq: 0 });
        }
    }

    /// Entries after `cursor`, in arrival order, first occurrence per path only.
    ///
    /// Returns the events and the cursor to pass next time.
    pub fn snapshot_since(&mut self, cursor: Option<Arrival>, now: Instant) -> (Vec<Event>, Option<Arrival>) {
        self.purge(now);

        let lower = match cursor {
            Some(arrival) => Bound::Excluded(arrival),
            None => Bound::Unbounded,
        };

        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut events = Vec::new();
        let mut last = cursor;
        for (arrival, event) in self.entries.range((lower, Bound::Unbounded)) {
            last = Some(*arrival);
            if seen.insert(event.path().to_path_buf()) {
                events.push(event.clone());
            }
        }
        (events, last)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Encode one SSE frame: id line, one data line per message line, blank line
pub fn encode_frame(id: u64, message: &str) -> String {
    let mut frame = format!("id: {}\n", id);
    for line in message.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    frame
}

struct SseState {
    pending: Mutex<PendingEventMap>,
    shutdown: Mutex<CancellationToken>,
    clients: AtomicUsize,
    allowed_origin: String,
    refresh: Duration,
}

/// Streams event paths to SSE clients
pub struct SseBroadcaster {
    options: StreamerOptions,
    state: Arc<SseState>,
}

impl SseBroadcaster {
    /// Create the adapter; events are kept for ten refresh intervals
    pub fn new(options: StreamerOptions) -> Self {
        let max_age = refresh_interval(&options) * 10;
        Self::with_max_age(options, max_age)
    }

    pub fn with_max_age(options: StreamerOptions, max_age: Duration) -> Self {
        let refresh = refresh_interval(&options);
        let state = Arc::new(SseState {
            pending: Mutex::new(PendingEventMap::new(max_age)),
            shutdown: Mutex::new(CancellationToken::new()),
            clients: AtomicUsize::new(0),
            allowed_origin: options.allowed_origin.clone(),
            refresh,
        });
        Self { options, state }
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.state.clients.load(Ordering::Relaxed)
    }

    pub fn pending_count(&self) -> usize {
        self.state.pending.lock().len()
    }
}

impl Broadcaster for SseBroadcaster {
    fn name(&self) -> &'static str {
        "sse"
    }

    fn routes(&self) -> Router {
        Router::new()
            .route(&self.options.path, get(stream_events))
            .with_state(self.state.clone())
    }

    fn start(&self, shutdown: &CancellationToken) -> Result<(), BroadcastError> {
        *self.state.shutdown.lock() = shutdown.child_token();
        info!("SSE stream available at {}", self.options.path);
        Ok(())
    }

    fn stop(&self) -> Result<(), BroadcastError> {
        self.state.shutdown.lock().cancel();
        debug!("SSE adapter stopped");
        Ok(())
    }

    fn send(&self, event: &Event) -> Result<(), BroadcastError> {
        self.state.pending.lock().insert(event.clone());
        Ok(())
    }
}

fn refresh_interval(options: &StreamerOptions) -> Duration {
    if options.refresh.is_zero() {
        StreamerOptions::default().refresh
    } else {
        options.refresh
    }
}

async fn stream_events(State(state): State<Arc<SseState>>) -> Response {
    let shutdown = state.shutdown.lock().clone();
    let headers = [
        (header::CONTENT_TYPE, "text/event-stream;charset=utf-8".to_string()),
        (header::CACHE_CONTROL, "no-cache".to_string()),
        (header::CONNECTION, "keep-alive".to_string()),
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, state.allowed_origin.clone()),
    ];
    (headers, Body::from_stream(event_stream(state, shutdown))).into_response()
}

/// Decrements the client count when the connection's stream is dropped
struct ClientGuard(Arc<SseState>);

impl ClientGuard {
    fn new(state: Arc<SseState>) -> Self {
        let count = state.clients.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("SSE client connected ({} total)", count);
        Self(state)
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let count = self.0.clients.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!("SSE client disconnected ({} remaining)", count);
    }
}

fn event_stream(state: Arc<SseState>, shutdown: CancellationToken) -> impl Stream<Item = Result<Bytes, Infallible>> {
    async_stream::stream! {
        let guard = ClientGuard::new(state);
        let mut ticker = interval(guard.0.refresh);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut next_id: u64 = 0;
        let mut cursor = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let events = {
                let mut pending = guard.0.pending.lock();
                let (events, next_cursor) = pending.snapshot_since(cursor, Instant::now());
                cursor = next_cursor;
                events
            };

            for event in events {
                yield Ok(Bytes::from(encode_frame(next_id, &event.path_string())));
                next_id += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Operation;
    use futures::StreamExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[test]
    fn test_encode_frame() {
        assert_eq!(encode_frame(7, "msg"), "id: 7\ndata: msg\n\n");
        assert_eq!(encode_frame(0, "a\nb"), "id: 0\ndata: a\ndata: b\n\n");
    }

    #[test]
    fn test_purge_keeps_only_recent_entries() {
        let mut map = PendingEventMap::new(Duration::from_millis(100));
        let start = Instant::now();

        map.insert_at(Event::new("/w/old", Operation::WRITE), start);
        map.insert_at(Event::new("/w/new", Operation::WRITE), start + Duration::from_millis(150));
        assert_eq!(map.len(), 1);

        let (events, _) = map.snapshot_since(None, start + Duration::from_millis(200));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path(), std::path::Path::new("/w/new"));

        map.purge(start + Duration::from_secs(1));
        assert!(map.is_empty());
    }

    #[test]
    fn test_snapshot_deduplicates_and_advances() {
        let mut map = PendingEventMap::new(Duration::from_secs(10));
        let now = Instant::now();

        map.insert_at(Event::new("/w/a.js", Operation::CREATE), now);
        map.insert_at(Event::new("/w/a.js", Operation::WRITE), now);
        map.insert_at(Event::new("/w/b.js", Operation::WRITE), now);
        map.insert_at(Event::new("/w/a.js", Operation::WRITE), now);

        let (events, cursor) = map.snapshot_since(None, now);
        let paths: Vec<_> = events.iter().map(|e| e.path_string()).collect();
        assert_eq!(paths, vec!["/w/a.js", "/w/b.js"]);
        assert!(events[0].operation().is_create());

        let (again, cursor) = map.snapshot_since(cursor, now);
        assert!(again.is_empty());

        map.insert_at(Event::new("/w/a.js", Operation::REMOVE), now);
        let (later, _) = map.snapshot_since(cursor, now);
        assert_eq!(later.len(), 1);
        assert!(later[0].operation().is_remove());
    }

    #[tokio::test]
    async fn test_stream_delivers_frames() {
        let adapter = SseBroadcaster::new(StreamerOptions {
            path: "/events".to_string(),
            allowed_origin: "http://localhost:3000".to_string(),
            refresh: Duration::from_millis(20),
        });
        let shutdown = CancellationToken::new();
        adapter.start(&shutdown).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = adapter.routes();
        let server_token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(server_token.cancelled_owned())
                .await
                .unwrap();
        });

        let response = reqwest::get(format!("http://{}/events", addr)).await.unwrap();
        assert_eq!(
            response.headers()[reqwest::header::CONTENT_TYPE],
            "text/event-stream;charset=utf-8"
        );
        assert_eq!(response.headers()[reqwest::header::CACHE_CONTROL], "no-cache");
        assert_eq!(
            response.headers()[reqwest::header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );

        adapter.send(&Event::new("/w/a.txt", Operation::CREATE)).unwrap();
        adapter.send(&Event::new("/w/a.txt", Operation::WRITE)).unwrap();

        let mut body = response.bytes_stream();
        let mut received = String::new();
        let _ = timeout(Duration::from_secs(2), async {
            while let Some(Ok(chunk)) = body.next().await {
                received.push_str(&String::from_utf8_lossy(&chunk));
                if received.contains("\n\n") {
                    break;
                }
            }
        })
        .await;

        assert!(received.starts_with("id: 0\ndata: /w/a.txt\n\n"), "got {received:?}");
        assert_eq!(adapter.client_count(), 1);

        // a later change to the same path is sent again with a new id
        adapter.send(&Event::new("/w/a.txt", Operation::WRITE)).unwrap();
        let mut more = String::new();
        let _ = timeout(Duration::from_secs(2), async {
            while let Some(Ok(chunk)) = body.next().await {
                more.push_str(&String::from_utf8_lossy(&chunk));
                if more.contains("\n\n") {
                    break;
                }
            }
        })
        .await;
        assert!(more.contains("data: /w/a.txt\n"), "got {more:?}");
        assert!(!more.starts_with("id: 0\n"), "ids must keep increasing");

        adapter.stop().unwrap();
        shutdown.cancel();
    }
}
