//! CLI argument parsing with subcommands.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Telegram-controlled tunnel launcher.
#[derive(Parser)]
#[command(name = "tunnelgram")]
#[command(about = "Open reverse SSH and ngrok tunnels from Telegram")]
#[command(version)]
pub struct Cli {
    /// Path to a JSON configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Register the command menu and poll for commands until Ctrl-C
    Run,

    /// Only publish the command menu to the allowed chats
    Register,

    /// Show current configuration status
    Status,
}
