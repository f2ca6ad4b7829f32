//! Error types for the watch pipeline
//!
//! Only setup failures surface as [`BlinkError`]. Problems with a single
//! directory, client or webhook delivery are logged where they happen and never
//! stop the pipeline.

use crate::broadcast::BroadcastError;
use crate::webhook::WebhookError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors raised while building or starting the pipeline
#[derive(Debug, Error)]
pub enum BlinkError {
    /// The watch root does not exist
    #[error("Watch root does not exist: {path}")]
    RootMissing { path: PathBuf },

    /// The watch root exists but is not a directory
    #[error("Watch root is not a directory: {path}")]
    NotADirectory { path: PathBuf },

    /// The native notification facility could not be initialised
    #[error("Filesystem notifications unavailable: {0}")]
    WatcherUnavailable(#[from] notify::Error),

    /// The event listener could not be bound
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The HTTP server stopped with an error
    #[error("Event server error: {0}")]
    Serve(#[source] io::Error),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

pub type Result<T> = std::result::Result<T, BlinkError>;
