use blink_core::StreamMethod;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use super::commands::config::ConfigCommand;

#[derive(Parser, Debug)]
#[command(
    name = "blink",
    version,
    about = "Blink - stream file changes to the browser",
    long_about = "Blink watches a directory tree and streams every change to connected browsers over Server-Sent Events or WebSockets, and can notify a webhook. Running it without a command starts watching."
)]
pub struct Cli {
    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log level or filter directive, overrides -v (e.g. "warn", "blink_core=trace")
    #[arg(long, global = true, env = "BLINK_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Disable colored log output
    #[arg(long, global = true, env = "BLINK_NO_COLOR")]
    pub no_color: bool,

    /// Path to configuration file (defaults to ~/.blink.toml)
    #[arg(short, long, global = true, env = "BLINK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub watch: WatchArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch a directory and serve its changes (the default)
    #[command(about = "Watch a directory and stream its changes")]
    Watch(WatchArgs),

    /// Inspect or create the configuration file
    #[command(about = "Show, locate or initialize the configuration file")]
    Config(ConfigCommand),
}

/// Settings that override the configuration file
#[derive(Args, Debug, Clone, Default)]
pub struct WatchArgs {
    /// Directory to watch
    #[arg(long, env = "BLINK_PATH")]
    pub path: Option<PathBuf>,

    /// Allowed origin for CORS and WebSocket upgrades ("*" allows any)
    #[arg(long, env = "BLINK_ALLOWED_ORIGIN")]
    pub allowed_origin: Option<String>,

    /// Listen address, ":port" listens on every interface
    #[arg(long, env = "BLINK_EVENT_ADDR")]
    pub event_addr: Option<String>,

    /// Route of the event stream
    #[arg(long, env = "BLINK_EVENT_PATH")]
    pub event_path: Option<String>,

    /// SSE refresh interval
    #[arg(long, value_name = "MS", env = "BLINK_REFRESH")]
    pub refresh: Option<u64>,

    /// Quiet period before a batch of events is handed on
    #[arg(long, value_name = "MS", env = "BLINK_HANDLER_DELAY")]
    pub handler_delay: Option<u64>,

    /// Interval between re-walks of the tree
    #[arg(long, value_name = "MS", env = "BLINK_POLL_INTERVAL")]
    pub poll_interval: Option<u64>,

    /// Log every accepted event
    #[arg(long, env = "BLINK_SHOW_EVENTS")]
    pub show_events: bool,

    /// Comma separated patterns a path must match
    #[arg(long, value_name = "PATTERNS", env = "BLINK_INCLUDE")]
    pub include: Option<String>,

    /// Comma separated patterns to drop
    #[arg(long, value_name = "PATTERNS", env = "BLINK_EXCLUDE")]
    pub exclude: Option<String>,

    /// Comma separated operations to keep (create, write, remove, rename, chmod)
    #[arg(long, value_name = "OPS", env = "BLINK_EVENTS")]
    pub events: Option<String>,

    /// Comma separated operations to drop
    #[arg(long, value_name = "OPS", env = "BLINK_IGNORE")]
    pub ignore: Option<String>,

    /// Skip build output, dependencies, editor files and VCS metadata
    #[arg(long, env = "BLINK_FILTER_DEV")]
    pub filter_dev: bool,

    /// Webhook URL to notify on every accepted event
    #[arg(long, env = "BLINK_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// HTTP method for the webhook
    #[arg(long, env = "BLINK_WEBHOOK_METHOD")]
    pub webhook_method: Option<String>,

    /// Extra webhook headers as "Name:value,Other:value"
    #[arg(long, env = "BLINK_WEBHOOK_HEADERS")]
    pub webhook_headers: Option<String>,

    /// Webhook request timeout
    #[arg(long, value_name = "MS", env = "BLINK_WEBHOOK_TIMEOUT")]
    pub webhook_timeout: Option<u64>,

    /// Minimum time between webhooks for the same path
    #[arg(long, value_name = "MS", env = "BLINK_WEBHOOK_DEBOUNCE")]
    pub webhook_debounce: Option<u64>,

    /// Retries after a failed webhook delivery
    #[arg(long, env = "BLINK_WEBHOOK_MAX_RETRIES")]
    pub webhook_max_retries: Option<u32>,

    /// Streaming protocol: sse, websocket or both
    #[arg(long, env = "BLINK_STREAM_METHOD")]
    pub stream_method: Option<StreamMethod>,
}
