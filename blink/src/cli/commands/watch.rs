//! The watch command: merge settings, start the server, wait for Ctrl-C

use crate::cli::WatchArgs;
use anyhow::{Context, Result, bail};
use blink_core::{BlinkConfig, BoundServer, EventServer, StreamMethod};
use std::collections::BTreeMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn execute(args: WatchArgs, config_path: Option<&Path>) -> Result<()> {
    let config = effective_config(&args, config_path)?;

    let server = EventServer::bind(config).await.context("Failed to start blink")?;
    print_summary(&server);

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                ctrl_c.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.run(shutdown).await?;
    info!("Blink stopped");
    Ok(())
}

/// Defaults, then the config file, then environment and flags
pub fn effective_config(args: &WatchArgs, config_path: Option<&Path>) -> Result<BlinkConfig> {
    let mut config = BlinkConfig::load(config_path)?;
    apply_overrides(&mut config, args)?;
    Ok(config)
}

pub fn apply_overrides(config: &mut BlinkConfig, args: &WatchArgs) -> Result<()> {
    if let Some(path) = &args.path {
        config.path = path.clone();
    }
    if let Some(origin) = &args.allowed_origin {
        config.allowed_origin = origin.clone();
    }
    if let Some(addr) = &args.event_addr {
        config.event_addr = addr.clone();
    }
    if let Some(event_path) = &args.event_path {
        config.event_path = event_path.clone();
    }
    if let Some(ms) = args.refresh {
        config.refresh_ms = ms;
    }
    if let Some(ms) = args.handler_delay {
        config.handler_delay_ms = ms;
    }
    if let Some(ms) = args.poll_interval {
        config.poll_interval_ms = ms;
    }
    if args.show_events {
        config.show_events = true;
    }
    if let Some(method) = args.stream_method {
        config.stream_method = method;
    }

    if let Some(include) = &args.include {
        config.filter.include = split_list(include);
    }
    if let Some(exclude) = &args.exclude {
        config.filter.exclude = split_list(exclude);
    }
    if let Some(events) = &args.events {
        config.filter.events = split_list(events);
    }
    if let Some(ignore) = &args.ignore {
        config.filter.ignore = split_list(ignore);
    }
    if args.filter_dev {
        config.filter.filter_dev = true;
    }

    if let Some(url) = &args.webhook_url {
        config.webhook.url = url.clone();
    }
    if let Some(method) = &args.webhook_method {
        config.webhook.method = method.clone();
    }
    if let Some(headers) = &args.webhook_headers {
        config.webhook.headers.extend(parse_headers(headers)?);
    }
    if let Some(ms) = args.webhook_timeout {
        config.webhook.timeout_ms = ms;
    }
    if let Some(ms) = args.webhook_debounce {
        config.webhook.debounce_ms = ms;
    }
    if let Some(retries) = args.webhook_max_retries {
        config.webhook.max_retries = retries;
    }

    Ok(())
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

/// Parse `Name:value,Other:value`; values may contain further colons
pub fn parse_headers(list: &str) -> Result<BTreeMap<String, String>> {
    let mut headers = BTreeMap::new();
    for pair in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((name, value)) = pair.split_once(':') else {
            bail!("Invalid webhook header '{}', expected Name:value", pair);
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("Invalid webhook header '{}', name is empty", pair);
        }
        headers.insert(name.to_string(), value.trim().to_string());
    }
    Ok(headers)
}

fn print_summary(server: &BoundServer) {
    let config = server.config();
    let addr = server.local_addr();

    println!("Blink is watching {}", server.root().display());
    match config.stream_method {
        StreamMethod::Sse => println!("  SSE:       http://{}{}", addr, config.event_path),
        StreamMethod::WebSocket => println!("  WebSocket: ws://{}{}", addr, config.event_path),
        StreamMethod::Both => {
            println!("  SSE:       http://{}{}", addr, config.event_path);
            println!(
                "  WebSocket: ws://{}{}/ws",
                addr,
                config.event_path.trim_end_matches('/')
            );
        }
    }
    println!("  Allowed origin: {}", config.allowed_origin);

    let filter = server.filter();
    if !filter.include_patterns().is_empty() {
        println!("  Include: {}", filter.include_patterns().join(", "));
    }
    if !filter.exclude_patterns().is_empty() {
        println!("  Exclude: {} patterns", filter.exclude_patterns().len());
    }
    if !config.filter.events.is_empty() {
        println!("  Events: {}", config.filter.events.join(", "));
    }
    if !config.filter.ignore.is_empty() {
        println!("  Ignoring: {}", config.filter.ignore.join(", "));
    }
    if server.webhook_enabled() {
        println!("  Webhook: {} {}", config.webhook.method, config.webhook.url);
    }
    println!("Press Ctrl-C to stop");
}
