//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::Config;

/// Tandem meeting command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "tandem", about = "Shared 3D scene meetings over the local network")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// TCP port to host on, or the default port when joining.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Maximum participants when hosting, host included.
    #[arg(long, global = true)]
    pub max_participants: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Room identifier used to store and restore alignment markers.
    #[arg(long, global = true)]
    pub room: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Model file to open into the scene. May be repeated.
    #[arg(long = "open", value_name = "FILE", global = true)]
    pub open: Vec<PathBuf>,
}

/// What to do once configured.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Host a meeting and relay between participants.
    Host,
    /// Join a meeting at `address` (`host` or `host:port`).
    Join { address: String },
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(max) = args.max_participants {
            self.network.max_participants = max;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
        if let Some(ref room) = args.room {
            self.room.room_id = room.clone();
        }
    }
}
