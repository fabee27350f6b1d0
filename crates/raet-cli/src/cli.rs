//! Clap CLI definitions for `raet`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  raet run                      Run a stack from ~/.raet/raet.toml
  raet run --lane               Also service the local lane socket
  raet keys list                Show remotes held in the keep
  raet keys accept minion-1     Accept a pending remote by name or uid
  raet keys delete 3            Forget a remote entirely";

/// RAET: reliable asynchronous event transport.
#[derive(Parser)]
#[command(name = "raet", version, about = "RAET road stack", after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Bind the configured address and service the stack until Ctrl+C.
    Run {
        /// Milliseconds between service ticks.
        #[arg(long, default_value_t = 10)]
        tick_ms: u64,
        /// Also open a lane stack under the configured socket directory.
        #[arg(long)]
        lane: bool,
    },
    /// Inspect and change remote trust in the keep [*].
    #[command(subcommand)]
    Keys(KeysCommands),
}

#[derive(Subcommand)]
pub enum KeysCommands {
    /// List every remote in the keep.
    List {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Mark a remote accepted.
    Accept {
        /// Remote name or uid.
        remote: String,
    },
    /// Mark a remote rejected.
    Reject {
        /// Remote name or uid.
        remote: String,
    },
    /// Remove a remote's road and safe records.
    Delete {
        /// Remote name or uid.
        remote: String,
    },
}
