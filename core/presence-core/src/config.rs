//! Presence configuration.
//!
//! Settings live in a TOML file owned by the host's settings store; this
//! module only reads it. Every section and field is optional and falls back
//! to the defaults below. The controller receives a `PresenceConfig` value at
//! construction and a replacement through `update_config`, so nothing here is
//! global.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_DIR_NAME: &str = "vs-presence";
const CONFIG_FILE_NAME: &str = "presence.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Application identifier registered with the presence service.
    pub client_id: String,
    /// Explicit endpoint; when unset the well-known socket names are probed.
    pub socket_path: Option<PathBuf>,
    pub handshake_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_reset_after_ms: u64,
    pub dispose_grace_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            socket_path: None,
            handshake_timeout_ms: 5_000,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 60_000,
            backoff_reset_after_ms: 30_000,
            dispose_grace_ms: 1_000,
        }
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn backoff_reset_after(&self) -> Duration {
        Duration::from_millis(self.backoff_reset_after_ms)
    }

    pub fn dispose_grace(&self) -> Duration {
        Duration::from_millis(self.dispose_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub show_file_name: bool,
    pub show_project_name: bool,
    pub show_timestamp: bool,
    /// Localized word placed before the file name.
    pub file_word: String,
    /// Localized word placed before the project name.
    pub project_word: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            show_file_name: true,
            show_project_name: true,
            show_timestamp: true,
            file_word: "File".to_string(),
            project_word: "Project".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub coalesce_window_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 250,
        }
    }
}

impl SyncConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }
}

impl PresenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let client_id = self.connection.client_id.trim();
        if client_id.is_empty() {
            return Err(ConfigError::Invalid(
                "connection.client_id is required".to_string(),
            ));
        }
        if !client_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::Invalid(
                "connection.client_id must be a numeric application id".to_string(),
            ));
        }

        let connection = &self.connection;
        let durations = [
            ("connection.handshake_timeout_ms", connection.handshake_timeout_ms),
            ("connection.backoff_base_ms", connection.backoff_base_ms),
            ("connection.backoff_reset_after_ms", connection.backoff_reset_after_ms),
            ("connection.dispose_grace_ms", connection.dispose_grace_ms),
            ("sync.coalesce_window_ms", self.sync.coalesce_window_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }
        if connection.backoff_cap_ms < connection.backoff_base_ms {
            return Err(ConfigError::Invalid(format!(
                "connection.backoff_cap_ms ({}) is below backoff_base_ms ({})",
                connection.backoff_cap_ms, connection.backoff_base_ms
            )));
        }

        Ok(())
    }
}

/// Returns the path to the presence configuration file.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let dir = dirs::config_dir().ok_or(ConfigError::ConfigDirNotFound)?;
    Ok(dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Loads the configuration, returning defaults if the file doesn't exist.
pub fn load_config(path: Option<PathBuf>) -> Result<PresenceConfig, ConfigError> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        tracing::debug!(path = %config_path.display(), "Presence config missing; using defaults");
        return Ok(PresenceConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    toml::from_str::<PresenceConfig>(&content).map_err(|err| ConfigError::Malformed {
        path: config_path,
        details: err.to_string(),
    })
}
