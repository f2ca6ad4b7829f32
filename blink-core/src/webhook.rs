//! Webhook notifications
//!
//! Each accepted event is posted as JSON to one configured endpoint. The
//! dispatcher keeps its own per-path debounce window, independent of the
//! batching in front of it, and retries failed deliveries a bounded number of
//! times with linearly growing pauses. Deliveries run as background tasks and
//! never hold up the watch pipeline.

use crate::event::{Event, Operation};
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

/// Errors raised while configuring or delivering webhooks
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Invalid webhook method: {0}")]
    InvalidMethod(String),

    #[error("Invalid webhook header '{name}': {message}")]
    InvalidHeader { name: String, message: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Webhook request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Webhook endpoint returned status {0}")]
    Status(u16),
}

/// How the payload timestamp is written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// `2024-01-31T12:00:00Z`
    #[default]
    Rfc3339,
    /// Milliseconds since the Unix epoch
    EpochMillis,
}

/// Webhook settings; an empty URL disables the webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: String,
    pub method: String,
    pub timeout_ms: u64,
    pub debounce_ms: u64,
    pub max_retries: u32,
    /// Base pause between attempts; the n-th retry waits n times this
    pub retry_backoff_ms: u64,
    pub timestamp_format: TimestampFormat,
    /// Sent with every request in addition to `Content-Type`
    pub headers: BTreeMap<String, String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "POST".to_string(),
            timeout_ms: 5000,
            debounce_ms: 100,
            max_retries: 3,
            retry_backoff_ms: 1000,
            timestamp_format: TimestampFormat::Rfc3339,
            headers: BTreeMap::new(),
        }
    }
}

impl WebhookConfig {
    pub fn is_enabled(&self) -> bool {
        !self.url.trim().is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Payload timestamp, either text or a number depending on [`TimestampFormat`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadTimestamp {
    Text(String),
    Millis(i64),
}

/// Body posted for every event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub path: String,
    pub event_type: String,
    pub timestamp: PayloadTimestamp,
}

impl WebhookPayload {
    pub fn from_event(event: &Event, format: TimestampFormat) -> Self {
        let timestamp = match format {
            TimestampFormat::Rfc3339 => {
                let time: DateTime<Utc> = event.time().into();
                PayloadTimestamp::Text(time.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
            TimestampFormat::EpochMillis => PayloadTimestamp::Millis(event.timestamp_millis()),
        };
        Self {
            path: event.path_string(),
            event_type: event.operation().wire_name().to_string(),
            timestamp,
        }
    }
}

/// One delivery in progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookJob {
    pub path: PathBuf,
    pub operation: Operation,
    /// Attempts made so far
    pub attempt: u32,
}

struct Endpoint {
    client: reqwest::Client,
    url: String,
    method: Method,
    headers: HeaderMap,
    max_retries: u32,
    backoff: Duration,
    format: TimestampFormat,
}

impl Endpoint {
    fn from_config(config: &WebhookConfig) -> Result<Self, WebhookError> {
        let method_name = config.method.trim().to_ascii_uppercase();
        let method = if method_name.is_empty() {
            Method::POST
        } else {
            Method::from_bytes(method_name.as_bytes())
                .map_err(|_| WebhookError::InvalidMethod(config.method.clone()))?
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let header_name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| {
                WebhookError::InvalidHeader {
                    name: name.clone(),
                    message: e.to_string(),
                }
            })?;
            let header_value = HeaderValue::from_str(value.trim()).map_err(|e| {
                WebhookError::InvalidHeader {
                    name: name.clone(),
                    message: e.to_string(),
                }
            })?;
            headers.insert(header_name, header_value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(WebhookError::Client)?;

        Ok(Self {
            client,
            url: config.url.trim().to_string(),
            method,
            headers,
            max_retries: config.max_retries,
            backoff: config.retry_backoff(),
            format: config.timestamp_format,
        })
    }

    async fn send_once(&self, payload: &WebhookPayload) -> Result<(), WebhookError> {
        let response = self
            .client
            .request(self.method.clone(), &self.url)
            .headers(self.headers.clone())
            .json(payload)
            .send()
            .await
            .map_err(WebhookError::Transport)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(WebhookError::Status(status.as_u16()))
        }
    }

    /// Try up to `max_retries + 1` times, pausing `backoff * n` after the n-th failure
    async fn deliver(
        &self,
        payload: &WebhookPayload,
        job: &mut WebhookJob,
        shutdown: &CancellationToken,
    ) -> Result<(), WebhookError> {
        loop {
            job.attempt += 1;
            let started = Instant::now();
            let result = self.send_once(payload).await;
            metrics::histogram!("blink_webhook_latency_seconds").record(started.elapsed().as_secs_f64());

            let err = match result {
                Ok(()) => {
                    debug!("Webhook delivered for {} (attempt {})", payload.path, job.attempt);
                    return Ok(());
                }
                Err(e) => e,
            };

            if job.attempt > self.max_retries {
                return Err(err);
            }

            let pause = retry_pause(self.backoff, job.attempt);
            warn!(
                "Webhook attempt {} for {} failed, retrying in {:?}: {}",
                job.attempt, payload.path, pause, err
            );
            tokio::select! {
                _ = shutdown.cancelled() => return Err(err),
                _ = sleep(pause) => {}
            }
        }
    }
}

/// Pause after the n-th failed attempt, saturating instead of overflowing
fn retry_pause(backoff: Duration, attempt: u32) -> Duration {
    backoff.saturating_mul(attempt)
}

/// Sends webhook notifications for accepted events
pub struct WebhookDispatcher {
    endpoint: Option<Arc<Endpoint>>,
    debounce: Duration,
    last_seen: Arc<DashMap<PathBuf, Instant>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl WebhookDispatcher {
    /// Validate the configuration and build the HTTP client.
    ///
    /// Without a URL the dispatcher is inert and every call is a no-op.
    pub fn new(config: &WebhookConfig) -> Result<Self, WebhookError> {
        let endpoint = if config.is_enabled() {
            Some(Arc::new(Endpoint::from_config(config)?))
        } else {
            None
        };

        Ok(Self {
            endpoint,
            debounce: config.debounce(),
            last_seen: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Spawn the sweep that forgets paths not seen for ten debounce windows
    pub fn start(&self) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };
        info!("Webhook enabled: {} {}", endpoint.method, endpoint.url);

        if self.debounce.is_zero() {
            return;
        }

        let last_seen = self.last_seen.clone();
        let max_age = self.debounce * 10;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = interval(max_age);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => sweep(&last_seen, max_age, Instant::now()),
                }
            }
        });
    }

    /// Post `event` unless its path was already sent within the debounce window
    pub fn handle_event(&self, event: &Event) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };

        if !self.should_send(event.path(), Instant::now()) {
            trace!("Webhook debounced for {}", event.path().display());
            return;
        }

        let endpoint = endpoint.clone();
        let payload = WebhookPayload::from_event(event, endpoint.format);
        let mut job = WebhookJob {
            path: event.path().to_path_buf(),
            operation: event.operation(),
            attempt: 0,
        };
        let shutdown = self.shutdown.clone();

        self.tasks.spawn(async move {
            if let Err(e) = endpoint.deliver(&payload, &mut job, &shutdown).await {
                error!(
                    "Webhook for {} ({}) abandoned after {} attempts: {}",
                    job.path.display(),
                    job.operation,
                    job.attempt,
                    e
                );
                metrics::counter!("blink_webhook_errors_total").increment(1);
            }
        });
    }

    /// Record `path` as seen at `now` unless it was seen within the window
    pub fn should_send(&self, path: &Path, now: Instant) -> bool {
        if self.debounce.is_zero() {
            return true;
        }
        match self.last_seen.entry(path.to_path_buf()) {
            Entry::Occupied(mut seen) => {
                if now.saturating_duration_since(*seen.get()) < self.debounce {
                    false
                } else {
                    seen.insert(now);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    /// Number of paths in the debounce map
    pub fn tracked_paths(&self) -> usize {
        self.last_seen.len()
    }

    /// Wait until every delivery started so far has finished
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Stop the sweep and pending retries, then wait at most `grace` for
    /// deliveries already on the wire
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.tasks.close();
        if timeout(grace, self.tasks.wait()).await.is_err() {
            warn!("Abandoning {} webhook deliveries still in flight", self.tasks.len());
        }
    }
}

fn sweep(last_seen: &DashMap<PathBuf, Instant>, max_age: Duration, now: Instant) {
    let before = last_seen.len();
    last_seen.retain(|_, seen| now.saturating_duration_since(*seen) < max_age);
    let removed = before.saturating_sub(last_seen.len());
    if removed > 0 {
        trace!("Webhook sweep forgot {} paths", removed);
    }
}
