//! Where the app keeps its files on this machine.

use std::io;
use std::path::{Path, PathBuf};

use tandem_config::ConfigError;

const APP_NAME: &str = "tandem";

/// OS-specific directories for config and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDirs {
    /// `config.ron` and `room_alignments.ron`.
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl AppDirs {
    /// Resolve the directories, honoring a `--config` override.
    ///
    /// Logs go to the platform's local data directory; with an override they
    /// sit next to the config instead.
    pub fn resolve(config_override: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(root) = config_override {
            return Ok(Self::rooted_at(root));
        }
        let config_dir = tandem_config::default_config_dir()?;
        let log_dir = dirs::data_local_dir()
            .map(|dir| dir.join(APP_NAME).join("logs"))
            .unwrap_or_else(|| config_dir.join("logs"));
        Ok(Self {
            config_dir,
            log_dir,
        })
    }

    /// Everything under `root`, for tests and `--config`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            config_dir: root.to_path_buf(),
            log_dir: root.join("logs"),
        }
    }

    pub fn create(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.log_dir)
    }
}
