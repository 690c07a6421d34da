//! Configuration file support for mmflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (MMFLASH_*)
//! 3. Local config file (./mmflash.toml)
//! 4. Global config file (~/.config/mmflash/config.toml)
//!
//! ```toml
//! [connection]
//! board = "SwiftIOMicro"
//! high_baud = 3000000
//!
//! [agent]
//! path = "agent.bin"
//! load_address = 0x2020_0000
//! ```

use crate::CliError;
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "mmflash.toml";

/// How to reach the device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
    /// Board name used to find the serial bridge.
    pub board: Option<String>,
    /// Description pattern used to find the serial bridge.
    pub device: Option<String>,
    /// Baud rate of the ROM listener.
    pub baud: Option<u32>,
    /// Baud rate requested after the first handshake.
    pub high_baud: Option<u32>,
}

/// Loader agent settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent image path.
    pub path: Option<PathBuf>,
    /// RAM address the agent is loaded to.
    pub load_address: Option<u64>,
    /// Baud rate the agent comes up at.
    pub baud: Option<u32>,
}

/// Wire protocol tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Resume address appended to RAM/flash END requests.
    pub end_resume_address: Option<u64>,
    /// DATA chunk size in bytes.
    pub chunk_size: Option<usize>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Loader agent.
    #[serde(default)]
    pub agent: AgentSection,
    /// Protocol settings.
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    ///
    /// Unreadable or malformed files are reported and skipped.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    ///
    /// Unlike the implicit files, an explicit path must exist and parse.
    pub fn load_from_path(path: &Path) -> Result<Self, CliError> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = toml::from_str(&content)
            .map_err(|e| CliError::Config(format!("invalid {}: {e}", path.display())))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "mmflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; values set in `other` win.
    fn merge(&mut self, other: Self) {
        let Self {
            connection,
            agent,
            protocol,
        } = other;

        merge_opt(&mut self.connection.port, connection.port);
        merge_opt(&mut self.connection.board, connection.board);
        merge_opt(&mut self.connection.device, connection.device);
        merge_opt(&mut self.connection.baud, connection.baud);
        merge_opt(&mut self.connection.high_baud, connection.high_baud);

        merge_opt(&mut self.agent.path, agent.path);
        merge_opt(&mut self.agent.load_address, agent.load_address);
        merge_opt(&mut self.agent.baud, agent.baud);

        merge_opt(&mut self.protocol.end_resume_address, protocol.end_resume_address);
        merge_opt(&mut self.protocol.chunk_size, protocol.chunk_size);
    }
}

fn merge_opt<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}
