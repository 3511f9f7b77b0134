//! confcheck - conference connectivity scenario runner

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use confcheck_core::HarnessConfig;

mod cli;
mod commands;

use cli::Cli;
use commands::CommandDispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_configuration(&cli)?;
    let dispatcher = CommandDispatcher::new(&cli, config)?;
    dispatcher.execute(cli.command).await
}

/// Setup logging; `RUST_LOG` wins over the verbosity flag
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Load configuration from defaults, confcheck.toml, an optional file and the environment
fn load_configuration(cli: &Cli) -> Result<HarnessConfig> {
    let config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            HarnessConfig::load_from_file(path)?
        }
        None => HarnessConfig::load()?,
    };
    Ok(config)
}
