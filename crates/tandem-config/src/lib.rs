//! Configuration for tandem meetings.
//!
//! Settings persist to disk as RON files and can be overridden from the
//! command line via clap. Room alignments (the two calibration markers per
//! physical room) are kept in their own RON file next to the config.

mod alignments;
mod cli;
mod config;
mod error;

pub use alignments::{ROOM_ALIGNMENTS_FILE, RoomAlignment, RoomAlignments};
pub use cli::{CliArgs, Command};
pub use config::{Config, DebugConfig, MeetingConfig, NetworkConfig, RoomConfig};
pub use error::ConfigError;

/// Platform config directory for tandem (`~/.config/tandem` on Linux).
pub fn default_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("tandem"))
        .ok_or(ConfigError::NoConfigDir)
}
