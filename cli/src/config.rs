// Configuration management for the Beamdrop CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/beamdrop/config.json
// - Linux: ~/.config/beamdrop/config.json
// - Windows: %APPDATA%\beamdrop\config.json

use anyhow::{Context, Result};
use beamdrop_core::config::CoreConfig;
use beamdrop_core::store::StorageKey;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SECRET_FILE: &str = "device.secret";
const REGISTRY_SALT: &[u8] = b"beamdrop registry v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stable id this install presents to peers
    pub device_id: String,

    /// Where received files land; defaults to the data directory
    pub download_dir: Option<String>,

    /// Also write logs to a daily file under the data directory
    pub log_to_file: bool,

    /// Everything the core reads
    pub core: CoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            download_dir: None,
            log_to_file: false,
            core: CoreConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("beamdrop");
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("beamdrop");
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Core settings with this install's identity filled in
    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            local_device_id: self.device_id.clone(),
            ..self.core.clone()
        }
    }

    pub fn download_dir(&self) -> Result<PathBuf> {
        match &self.download_dir {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => Ok(Self::data_dir()?.join("received")),
        }
    }

    /// Set a config value (does not save)
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "download_dir" => {
                self.download_dir = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "log_to_file" => {
                self.log_to_file = value.parse().context("Invalid boolean value")?;
            }
            "relay_fallback" => {
                self.core.discovery.relay_fallback = value.parse().context("Invalid boolean value")?;
            }
            "connect_timeout" => {
                self.core.discovery.connect_timeout_secs = value.parse().context("Invalid number")?;
            }
            "handshake_timeout" => {
                self.core.session.handshake_timeout_secs = value.parse().context("Invalid number")?;
            }
            "max_retries" => {
                self.core.transfer.max_retries = value.parse().context("Invalid number")?;
            }
            "chunk_size" => {
                let size: usize = value.parse().context("Invalid number")?;
                let transfer = &self.core.transfer;
                if size < transfer.min_chunk_size || size > transfer.max_chunk_size {
                    anyhow::bail!(
                        "chunk_size must be between {} and {}",
                        transfer.min_chunk_size,
                        transfer.max_chunk_size
                    );
                }
                self.core.transfer.default_chunk_size = size;
            }
            "retention_hours" => {
                let hours: u64 = value.parse().context("Invalid number")?;
                self.core.transfer.retention_secs = hours * 3600;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.list().into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("device_id".to_string(), self.device_id.clone()),
            (
                "download_dir".to_string(),
                self.download_dir.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            ("log_to_file".to_string(), self.log_to_file.to_string()),
            (
                "relay_fallback".to_string(),
                self.core.discovery.relay_fallback.to_string(),
            ),
            (
                "connect_timeout".to_string(),
                self.core.discovery.connect_timeout_secs.to_string(),
            ),
            (
                "handshake_timeout".to_string(),
                self.core.session.handshake_timeout_secs.to_string(),
            ),
            ("max_retries".to_string(), self.core.transfer.max_retries.to_string()),
            (
                "chunk_size".to_string(),
                self.core.transfer.default_chunk_size.to_string(),
            ),
            (
                "retention_hours".to_string(),
                (self.core.transfer.retention_secs / 3600).to_string(),
            ),
        ]
    }
}

/// Key sealing the connection registry, derived from a per-install secret
/// that is created on first use
pub fn storage_key(data_dir: &Path) -> Result<StorageKey> {
    let path = data_dir.join(SECRET_FILE);
    let secret = if path.exists() {
        std::fs::read_to_string(&path).context("Failed to read device secret")?
    } else {
        let secret = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        std::fs::write(&path, &secret).context("Failed to write device secret")?;
        secret
    };
    Ok(StorageKey::derive(secret.trim().as_bytes(), REGISTRY_SALT))
}
