//! CLI commands

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Liveline - WebSocket bridge to a streaming generative service
#[derive(Parser, Debug)]
#[command(name = "liveline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a config file (liveline.jsonc/.json/.yml/.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the gateway server
    Serve {
        /// Host to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Chat with a running gateway from the terminal
    Chat {
        /// Gateway base URL
        #[arg(long, default_value = "ws://127.0.0.1:8000")]
        url: String,

        /// Client id used in the connection path
        #[arg(long, default_value = "cli")]
        client_id: String,

        /// System prompt sent in the config frame
        #[arg(long, default_value = "You are a helpful assistant.")]
        system_prompt: String,

        /// Prebuilt voice name; enables spoken responses
        #[arg(long)]
        voice: Option<String>,
    },
}
