use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "relay-engine")]
#[command(about = "AI provider relay with channel failover, health monitoring and async task billing")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "relay-engine.toml")]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Run the HTTP server and background workers
    Serve,

    /// Test channels once and exit
    TestChannels {
        /// Which channels to test (all, enabled, disabled)
        #[arg(short, long, default_value = "all")]
        scope: String,
    },

    /// Import keys into a channel from a file
    ImportKeys {
        /// Channel id
        #[arg(long)]
        channel: i64,

        /// File with one key per line or a JSON array of keys
        #[arg(short, long)]
        file: PathBuf,

        /// Import mode (append, overwrite)
        #[arg(short, long, default_value = "append")]
        mode: String,
    },
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Serve)
    }
}
