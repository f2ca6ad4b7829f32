//! Core functionality for blink
//!
//! Blink watches a directory tree and pushes what changes in it to browsers
//! over Server-Sent Events or WebSockets, and optionally to a webhook. This
//! crate holds the whole pipeline; the `blink` binary only parses arguments.
//!
//! ```text
//! notify ─► monitor (tracker, batcher) ─► server ─► filter ─┬─► broadcast (sse / websocket)
//!                                                           └─► webhook
//! ```

pub mod broadcast;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod monitor;
pub mod server;
pub mod webhook;

pub use broadcast::{Broadcaster, StreamMethod, StreamerOptions};
pub use config::BlinkConfig;
pub use error::{BlinkError, Result};
pub use event::{Event, Operation};
pub use filter::{EventFilter, FilterConfig};
pub use server::{BoundServer, EventServer};
pub use webhook::{WebhookConfig, WebhookDispatcher};
