//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file layered over confcheck.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override passed to every participant, as key=value (repeatable)
    #[arg(short = 'o', long = "override", global = true)]
    pub overrides: Vec<String>,

    /// Print scenario reports and configuration as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Block, restore and expire a peer and check every participant's indicators
    PeerStatus,
    /// Keep three participants in a call, then hang up
    Performance {
        /// How long to stay in the call, overriding timing.performance_hold_ms
        #[arg(long)]
        hold_secs: Option<u64>,
        /// Number of participants
        #[arg(long, default_value_t = 3)]
        participants: u32,
    },
    /// Block one port through the fault injection script
    BlockPort {
        /// Port number to block
        #[arg(allow_hyphen_values = true)]
        port: String,
    },
    /// Remove every block applied through the fault injection script
    ClearRules,
    /// Print the effective configuration as TOML
    ShowConfig,
}
