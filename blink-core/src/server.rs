//! The event server: owns the watcher, the filter, the adapters and the webhook
//!
//! [`EventServer::bind`] does all fallible setup up front so a bad root, a
//! broken webhook configuration or a taken port is reported before anything
//! starts. [`BoundServer::run`] then drives the pipeline until cancelled.

use crate::broadcast::{Broadcaster, build_broadcaster};
use crate::config::BlinkConfig;
use crate::error::BlinkError;
use crate::event::Event;
use crate::filter::EventFilter;
use crate::monitor::{FileWatcher, WatchStreams};
use crate::webhook::WebhookDispatcher;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// How long in-flight webhook deliveries may run after shutdown
pub const WEBHOOK_GRACE: Duration = Duration::from_secs(5);

/// Entry point for building a server
pub struct EventServer;

impl EventServer {
    /// Validate the configuration, build every component and bind the listener
    pub async fn bind(config: BlinkConfig) -> Result<BoundServer, BlinkError> {
        let watcher = FileWatcher::new(config.watcher_config())?;
        let filter = EventFilter::from_config(&config.filter, watcher.root());
        debug!("Event filter: {:?}", filter);

        let webhook = WebhookDispatcher::new(&config.webhook)?;
        let broadcaster = build_broadcaster(config.stream_method, config.streamer_options());

        let address = config.listen_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| BlinkError::Bind {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BlinkError::Bind { address, source })?;

        Ok(BoundServer {
            local_addr,
            listener,
            watcher,
            dispatch: Dispatch {
                filter,
                broadcaster,
                webhook: Arc::new(webhook),
                show_events: config.show_events,
            },
            config,
        })
    }
}

/// A fully built server whose listener is already bound
pub struct BoundServer {
    config: BlinkConfig,
    local_addr: SocketAddr,
    listener: TcpListener,
    watcher: FileWatcher,
    dispatch: Dispatch,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Canonical watch root
    pub fn root(&self) -> &Path {
        self.watcher.root()
    }

    pub fn config(&self) -> &BlinkConfig {
        &self.config
    }

    pub fn filter(&self) -> &EventFilter {
        &self.dispatch.filter
    }

    pub fn webhook_enabled(&self) -> bool {
        self.dispatch.webhook.is_enabled()
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BlinkError> {
        let BoundServer {
            config,
            local_addr,
            listener,
            watcher,
            dispatch,
        } = self;
        let local = shutdown.child_token();

        dispatch.broadcaster.start(&local)?;
        dispatch.webhook.start();
        let WatchStreams {
            mut batches,
            mut errors,
        } = watcher.start(local.clone()).await?;

        let app = dispatch.broadcaster.routes();
        let server_token = local.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(server_token.cancelled_owned())
                .await
        });
        info!(
            "Serving {} events on http://{}{}",
            config.stream_method, local_addr, config.event_path
        );

        loop {
            tokio::select! {
                _ = local.cancelled() => {
                    info!("Shutting down event server");
                    break;
                }
                Some(batch) = batches.recv() => dispatch.process(batch),
                Some(err) = errors.recv() => warn!("Watch error: {}", err),
            }
        }

        if let Err(e) = dispatch.broadcaster.stop() {
            warn!("Failed to stop {} adapter: {}", dispatch.broadcaster.name(), e);
        }
        dispatch.webhook.shutdown(WEBHOOK_GRACE).await;

        match server.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BlinkError::Serve(e)),
            Err(e) => {
                warn!("Event server task failed: {}", e);
                Ok(())
            }
        }
    }
}

/// Everything that happens to a batch after the watcher hands it over
struct Dispatch {
    filter: EventFilter,
    broadcaster: Arc<dyn Broadcaster>,
    webhook: Arc<WebhookDispatcher>,
    show_events: bool,
}

impl Dispatch {
    fn process(&self, batch: Vec<Event>) {
        for event in accept_batch(&self.filter, batch) {
            metrics::counter!("blink_events_processed_total").increment(1);

            if self.show_events {
                info!("{}", event);
            }
            if let Err(e) = self.broadcaster.send(&event) {
                warn!("Failed to broadcast {}: {}", event, e);
            }
            self.webhook.handle_event(&event);
        }
    }
}

/// Drop the events the filter rejects, then coalesce what is left
///
/// Filtering comes first so a rejected operation on a path cannot replace an
/// accepted one.
pub fn accept_batch(filter: &EventFilter, batch: Vec<Event>) -> Vec<Event> {
    let accepted: Vec<Event> = batch
        .into_iter()
        .filter(|event| {
            let keep = filter.should_process(event);
            if !keep {
                trace!("Filtered {}", event);
                metrics::counter!("blink_events_filtered_total").increment(1);
            }
            keep
        })
        .collect();
    coalesce_batch(accepted)
}

/// Keep one event per path: at the position the path first appeared,
/// carrying its last operation
pub fn coalesce_batch(batch: Vec<Event>) -> Vec<Event> {
    let mut positions: HashMap<PathBuf, usize> = HashMap::with_capacity(batch.len());
    let mut coalesced: Vec<Event> = Vec::with_capacity(batch.len());

    for event in batch {
        match positions.get(event.path()) {
            Some(&index) => coalesced[index] = event,
            None => {
                positions.insert(event.path().to_path_buf(), coalesced.len());
                coalesced.push(event);
            }
        }
    }
    coalesced
}
