//! Meeting settings, stored as `config.ron`.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the main configuration inside the config directory.
pub const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listening, joining and tick settings.
    pub network: NetworkConfig,
    /// Replication tuning.
    pub meeting: MeetingConfig,
    /// Which physical room this machine is in.
    pub room: RoomConfig,
    pub debug: DebugConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface the host listens on.
    pub bind_address: String,
    /// TCP port for hosting, and the default port when joining.
    pub port: u16,
    /// Maximum participants in a hosted meeting, host included.
    pub max_participants: u32,
    /// Connect plus handshake timeout when joining, in seconds.
    pub connect_timeout_seconds: u32,
    /// Session ticks per second.
    pub tick_rate: u32,
}

/// Replication tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeetingConfig {
    /// Seconds without an avatar update before that avatar is hidden.
    pub avatar_stale_seconds: f32,
    /// Outbound queue depth at which avatar updates start being dropped.
    pub lossy_queue_threshold: u32,
}

/// Room identity, the key for persisted alignments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoomConfig {
    pub room_id: String,
}

/// Diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 21213,
            max_participants: 100,
            connect_timeout_seconds: 10,
            tick_rate: 60,
        }
    }
}

impl Default for MeetingConfig {
    fn default() -> Self {
        Self {
            avatar_stale_seconds: 3.0,
            lossy_queue_threshold: 10,
        }
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            room_id: "default".to_string(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- RON helpers shared with the alignment file ---

pub(crate) fn read_ron<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn write_ron<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let pretty = ron::ser::PrettyConfig::new()
        .depth_limit(3)
        .separate_tuple_members(true)
        .enumerate_arrays(false);
    let serialized = ron::ser::to_string_pretty(value, pretty).map_err(ConfigError::Serialize)?;
    std::fs::write(path, serialized).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

impl Config {
    /// Read `config.ron` from `config_dir`, writing the defaults there first
    /// if it does not exist yet.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config: Config = read_ron(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Write to `config_dir/config.ron`, creating the directory as needed.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        write_ron(&config_dir.join(CONFIG_FILE), self)
    }

    /// Re-read the file; `Some` only when it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config: Config = read_ron(&config_dir.join(CONFIG_FILE))?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
