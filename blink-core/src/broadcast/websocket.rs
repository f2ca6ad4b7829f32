//! WebSocket adapter
//!
//! Every client gets a bounded outbound queue, a writer task that drains it
//! (and pings on an interval) and a reader that only watches for the client
//! going away. [`WebSocketBroadcaster::send`] never waits: a client whose
//! queue is full simply misses that message.

use crate::broadcast::{BroadcastError, Broadcaster, StreamerOptions};
use crate::event::Event;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Outbound messages buffered per client
pub const CLIENT_QUEUE_CAPACITY: usize = 256;
/// Interval between keepalive pings
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Longest a single write may take before the client is dropped
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest a client may stay silent (pongs included) before it is dropped
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// JSON message sent for every event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub path: String,
    pub operation: String,
}

impl WireMessage {
    pub fn from_event(event: &Event) -> Self {
        Self {
            kind: "event".to_string(),
            timestamp: event.timestamp_millis(),
            path: event.path_string(),
            operation: event.operation().wire_name().to_string(),
        }
    }
}

/// Outcome of one fan-out
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

/// Connected clients and their outbound queues
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<Uuid, mpsc::Sender<Utf8Bytes>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, queue: mpsc::Sender<Utf8Bytes>) {
        self.clients.write().insert(id, queue);
    }

    pub fn deregister(&self, id: &Uuid) -> bool {
        self.clients.write().remove(id).is_some()
    }

    /// Offer `message` to every client without waiting on any of them
    pub fn broadcast(&self, message: &Utf8Bytes) -> Delivery {
        let mut delivery = Delivery::default();
        let clients = self.clients.read();
        for (id, queue) in clients.iter() {
            match queue.try_send(message.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(client = %id, "Client queue full, dropping message");
                    metrics::counter!("blink_dropped_messages_total", "adapter" => "websocket").increment(1);
                    delivery.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(client = %id, "Client queue closed, dropping message");
                    delivery.dropped += 1;
                }
            }
        }
        delivery
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Forget every client; their writers see the queue close and hang up
    pub fn clear(&self) {
        self.clients.write().clear();
    }
}

struct WsState {
    registry: ClientRegistry,
    shutdown: Mutex<CancellationToken>,
    allowed_origin: String,
}

/// Streams events to WebSocket clients as JSON
pub struct WebSocketBroadcaster {
    options: StreamerOptions,
    state: Arc<WsState>,
}

impl WebSocketBroadcaster {
    pub fn new(options: StreamerOptions) -> Self {
        let state = Arc::new(WsState {
            registry: ClientRegistry::new(),
            shutdown: Mutex::new(CancellationToken::new()),
            allowed_origin: options.allowed_origin.clone(),
        });
        Self { options, state }
    }

    pub fn client_count(&self) -> usize {
        self.state.registry.len()
    }
}

impl Broadcaster for WebSocketBroadcaster {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn routes(&self) -> Router {
        Router::new()
            .route(&self.options.path, get(upgrade))
            .with_state(self.state.clone())
    }

    fn start(&self, shutdown: &CancellationToken) -> Result<(), BroadcastError> {
        *self.state.shutdown.lock() = shutdown.child_token();
        info!("WebSocket stream available at {}", self.options.path);
        Ok(())
    }

    fn stop(&self) -> Result<(), BroadcastError> {
        self.state.shutdown.lock().cancel();
        self.state.registry.clear();
        debug!("WebSocket adapter stopped");
        Ok(())
    }

    fn send(&self, event: &Event) -> Result<(), BroadcastError> {
        let json = serde_json::to_string(&WireMessage::from_event(event))?;
        let delivery = self.state.registry.broadcast(&Utf8Bytes::from(json));
        trace!(
            "Sent {} to {} clients ({} dropped)",
            event,
            delivery.delivered,
            delivery.dropped
        );
        Ok(())
    }
}

/// A missing `Origin` header is allowed; browsers always send one
fn origin_allowed(allowed: &str, origin: Option<&HeaderValue>) -> bool {
    if allowed == "*" {
        return true;
    }
    match origin {
        Some(origin) => origin.as_bytes() == allowed.as_bytes(),
        None => true,
    }
}

async fn upgrade(
    State(state): State<Arc<WsState>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!("Rejected WebSocket handshake: {}", rejection.body_text());
            return rejection.into_response();
        }
    };

    if !origin_allowed(&state.allowed_origin, headers.get(header::ORIGIN)) {
        warn!("Rejected WebSocket connection from origin {:?}", headers.get(header::ORIGIN));
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let shutdown = state.shutdown.lock().child_token();
    ws.on_failed_upgrade(|e| warn!("WebSocket upgrade failed: {}", e))
        .on_upgrade(move |socket| handle_socket(socket, state, shutdown))
}

async fn handle_socket(socket: WebSocket, state: Arc<WsState>, shutdown: CancellationToken) {
    let id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Utf8Bytes>(CLIENT_QUEUE_CAPACITY);
    state.registry.register(id, tx);
    info!(client = %id, "WebSocket client connected");

    let writer_token = shutdown.clone();
    let writer = tokio::spawn(async move {
        let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        loop {
            let message = tokio::select! {
                _ = writer_token.cancelled() => Message::Close(None),
                queued = rx.recv() => match queued {
                    Some(text) => Message::Text(text),
                    None => Message::Close(None),
                },
                _ = ping.tick() => Message::Ping(Bytes::new()),
            };

            let closing = matches!(message, Message::Close(_));
            match timeout(WRITE_TIMEOUT, sink.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(client = %id, "WebSocket write failed: {}", e);
                    break;
                }
                Err(_) => {
                    warn!(client = %id, "WebSocket write timed out");
                    break;
                }
            }
            if closing {
                break;
            }
        }
        writer_token.cancel();
    });

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = timeout(READ_TIMEOUT, stream.next()) => match incoming {
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(client = %id, "WebSocket read failed: {}", e);
                    break;
                }
                // pongs and client data only prove the connection is alive
                Ok(Some(Ok(_))) => {}
                Err(_) => {
                    warn!(client = %id, "WebSocket client idle for {:?}, disconnecting", READ_TIMEOUT);
                    break;
                }
            }
        }
    }

    state.registry.deregister(&id);
    shutdown.cancel();
    if let Err(e) = writer.await {
        debug!(client = %id, "WebSocket writer ended abnormally: {}", e);
    }
    info!(client = %id, "WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Operation;
    use tokio::net::TcpListener;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};

    async fn serve(adapter: &WebSocketBroadcaster, shutdown: &CancellationToken) -> std::net::SocketAddr {
        adapter.start(shutdown).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = adapter.routes();
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
                .unwrap();
        });
        addr
    }

    async fn wait_for_clients(adapter: &WebSocketBroadcaster, count: usize) {
        for _ in 0..100 {
            if adapter.client_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {count} clients, have {}", adapter.client_count());
    }

    #[test]
    fn test_wire_message_round_trip() {
        let event = Event::new("/watch/a.js", Operation::WRITE | Operation::CHMOD);
        let json = serde_json::to_string(&WireMessage::from_event(&event)).unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["operation"], "write");

        let decoded: WireMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.path, "/watch/a.js");
        assert_eq!(decoded.timestamp, event.timestamp_millis());
    }

    #[test]
    fn test_origin_check() {
        let origin = HeaderValue::from_static("http://localhost:3000");
        assert!(origin_allowed("*", Some(&origin)));
        assert!(origin_allowed("http://localhost:3000", Some(&origin)));
        assert!(!origin_allowed("http://example.com", Some(&origin)));
        assert!(origin_allowed("http://example.com", None));
    }

    #[tokio::test]
    async fn test_full_queue_only_affects_its_client() {
        let registry = ClientRegistry::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(1);
        let (gone_tx, gone_rx) = mpsc::channel(1);
        registry.register(Uuid::new_v4(), slow_tx);
        registry.register(Uuid::new_v4(), fast_tx);
        registry.register(Uuid::new_v4(), gone_tx);
        drop(gone_rx);

        let first = registry.broadcast(&Utf8Bytes::from("one"));
        assert_eq!(first, Delivery { delivered: 2, dropped: 1 });
        assert_eq!(fast_rx.recv().await.unwrap().as_str(), "one");

        let second = registry.broadcast(&Utf8Bytes::from("two"));
        assert_eq!(second, Delivery { delivered: 1, dropped: 2 });
        assert_eq!(fast_rx.recv().await.unwrap().as_str(), "two");
    }

    #[tokio::test]
    async fn test_client_receives_events() {
        let adapter = WebSocketBroadcaster::new(StreamerOptions {
            path: "/events".to_string(),
            ..StreamerOptions::default()
        });
        let shutdown = CancellationToken::new();
        let addr = serve(&adapter, &shutdown).await;

        let (mut client, _) = connect_async(format!("ws://{}/events", addr)).await.unwrap();
        wait_for_clients(&adapter, 1).await;

        let event = Event::new("/watch/a.js", Operation::CREATE);
        adapter.send(&event).unwrap();

        let message = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("no message")
            .expect("stream ended")
            .unwrap();
        let tungstenite::Message::Text(text) = message else {
            panic!("expected text, got {message:?}");
        };
        let decoded: WireMessage = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(decoded, WireMessage::from_event(&event));

        client.close(None).await.unwrap();
        wait_for_clients(&adapter, 0).await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stop_disconnects_clients() {
        let adapter = WebSocketBroadcaster::new(StreamerOptions::default());
        let shutdown = CancellationToken::new();
        let addr = serve(&adapter, &shutdown).await;

        let (mut client, _) = connect_async(format!("ws://{}/events", addr)).await.unwrap();
        wait_for_clients(&adapter, 1).await;

        adapter.stop().unwrap();

        let ended = timeout(Duration::from_secs(2), async {
            loop {
                match client.next().await {
                    Some(Ok(tungstenite::Message::Close(_))) | None | Some(Err(_)) => return true,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(ended, "client was not disconnected");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_foreign_origin_is_rejected() {
        let adapter = WebSocketBroadcaster::new(StreamerOptions {
            allowed_origin: "http://localhost:3000".to_string(),
            ..StreamerOptions::default()
        });
        let shutdown = CancellationToken::new();
        let addr = serve(&adapter, &shutdown).await;

        let mut request = format!("ws://{}/events", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Origin", "http://evil.example".parse().unwrap());
        assert!(connect_async(request).await.is_err());

        // a plain GET is not a handshake
        let response = reqwest::get(format!("http://{}/events", addr)).await.unwrap();
        assert!(response.status().is_client_error());
        assert_eq!(adapter.client_count(), 0);
        shutdown.cancel();
    }
}
