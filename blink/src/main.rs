use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
use cli::{Cli, Commands};

fn main() -> Result<()> {
    // Parse CLI arguments first to get verbosity level
    let cli = Cli::parse();

    let directive = log_directive(
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        cli.log_level.as_deref(),
        cli.verbose,
    );
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("Invalid log filter '{}'", directive))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(!cli.no_color))
        .with(filter)
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        None => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(cli::commands::watch::execute(cli.watch, config_path))?;
        }
        Some(Commands::Watch(args)) => {
            debug!("Watch command: {:?}", args);
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(cli::commands::watch::execute(args, config_path))?;
        }
        Some(Commands::Config(command)) => {
            debug!("Config command: {:?}", command);
            cli::commands::config::handle_config_command(command, &cli.watch, config_path)?;
        }
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise `--log-level`, raised by each `-v`
fn log_directive(env: Option<String>, log_level: Option<&str>, verbose: u8) -> String {
    if let Some(env) = env.filter(|e| !e.trim().is_empty()) {
        return env;
    }

    let base = log_level.unwrap_or("info");
    match verbose {
        0 => base,
        1 if base.eq_ignore_ascii_case("trace") => base,
        1 => "debug",
        _ => "trace",
    }
    .to_string()
}
