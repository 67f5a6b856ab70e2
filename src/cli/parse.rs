//! CLI parse: clap types for skein. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// skein - workspace snapshots, AI context and conversations
#[derive(Parser)]
#[command(name = "skein")]
#[command(about = "Watch a workspace, prepare AI context and stream conversations")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Open the workspace and print its tree
    Tree {
        /// Show the inclusion state next to each entry
        #[arg(long)]
        inclusion: bool,
    },
    /// Prepare AI context and print what would be attached
    Context {
        /// File or directory to focus; defaults to the persisted selection
        path: Option<PathBuf>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Stream workspace updates until interrupted
    Watch,
    /// Send one message and stream the reply
    Chat {
        /// Message text
        message: String,
        /// File the conversation is about; defaults to the workspace root
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// List stored conversations
    Conversations,
}
