use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use uoproxy::config::{Cli, Config};
use uoproxy::listener;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli)?;

    init_logging(config.verbosity);

    listener::run(Arc::new(config)).await
}

/// Maps the config's verbosity knob onto a `tracing` filter: `0` mutes
/// everything, higher levels step down through warn/info/debug/trace the
/// way the original's `-v`-repeated flag did.
fn init_logging(verbosity: u8) {
    let directive = match verbosity {
        0 => "off",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)),
        )
        .init();
}
