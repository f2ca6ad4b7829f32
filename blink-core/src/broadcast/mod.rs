//! Delivery of accepted events to streaming clients
//!
//! Each protocol lives in its own adapter with its own client bookkeeping:
//! [`sse::SseBroadcaster`] for Server-Sent Events and
//! [`websocket::WebSocketBroadcaster`] for WebSockets. [`composite::CompositeBroadcaster`]
//! fans out to several adapters. Adapters contribute routes to the server's
//! single listener rather than binding their own.

pub mod composite;
pub mod sse;
pub mod websocket;

pub use composite::CompositeBroadcaster;
pub use sse::{PendingEventMap, SseBroadcaster, encode_frame};
pub use websocket::{ClientRegistry, WebSocketBroadcaster, WireMessage};

use crate::event::Event;
use axum::Router;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors raised by broadcast adapters
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// The event could not be serialized for the wire
    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    /// An adapter failed for another reason
    #[error("{adapter} adapter error: {message}")]
    Adapter { adapter: String, message: String },
}

/// Common contract of every protocol adapter
pub trait Broadcaster: Send + Sync {
    /// Short protocol name, used in logs
    fn name(&self) -> &'static str;

    /// Routes this adapter serves, merged into the server's router
    fn routes(&self) -> Router;

    /// Begin accepting clients; client connections end when `shutdown` is cancelled
    fn start(&self, shutdown: &CancellationToken) -> Result<(), BroadcastError>;

    /// Disconnect every client
    fn stop(&self) -> Result<(), BroadcastError>;

    /// Queue an event for every connected client without waiting on any of them
    fn send(&self, event: &Event) -> Result<(), BroadcastError>;
}

/// Which streaming protocols to serve
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMethod {
    #[default]
    Sse,
    #[serde(alias = "ws")]
    WebSocket,
    Both,
}

impl FromStr for StreamMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sse" => Ok(StreamMethod::Sse),
            "websocket" | "ws" => Ok(StreamMethod::WebSocket),
            "both" => Ok(StreamMethod::Both),
            other => Err(format!("unknown stream method '{}' (expected sse, websocket or both)", other)),
        }
    }
}

impl fmt::Display for StreamMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamMethod::Sse => write!(f, "sse"),
            StreamMethod::WebSocket => write!(f, "websocket"),
            StreamMethod::Both => write!(f, "both"),
        }
    }
}

/// Settings shared by the adapters
#[derive(Debug, Clone)]
pub struct StreamerOptions {
    /// Route of the stream
    pub path: String,
    /// Value for `Access-Control-Allow-Origin` and the WebSocket origin check
    pub allowed_origin: String,
    /// SSE refresh interval
    pub refresh: Duration,
}

impl Default for StreamerOptions {
    fn default() -> Self {
        Self {
            path: "/events".to_string(),
            allowed_origin: "*".to_string(),
            refresh: Duration::from_millis(100),
        }
    }
}

/// Build the adapter(s) for `method`.
///
/// With [`StreamMethod::Both`] the WebSocket route is `path` + `/ws`.
pub fn build_broadcaster(method: StreamMethod, options: StreamerOptions) -> Arc<dyn Broadcaster> {
    match method {
        StreamMethod::Sse => Arc::new(SseBroadcaster::new(options)),
        StreamMethod::WebSocket => Arc::new(WebSocketBroadcaster::new(options)),
        StreamMethod::Both => {
            let ws_options = StreamerOptions {
                path: format!("{}/ws", options.path.trim_end_matches('/')),
                ..options.clone()
            };
            let adapters: Vec<Arc<dyn Broadcaster>> = vec![
                Arc::new(SseBroadcaster::new(options)),
                Arc::new(WebSocketBroadcaster::new(ws_options)),
            ];
            Arc::new(CompositeBroadcaster::new(adapters))
        }
    }
}
