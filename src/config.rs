use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chat::SessionSettings;
use crate::error::{ChatError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub socket_addr: String,
    pub user_id: String,
    pub ack_timeout_ms: u64,
    pub max_send_attempts: u32,
    pub page_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            api_base_url: "http://127.0.0.1:8080/api".to_string(),
            socket_addr: "127.0.0.1:9090".to_string(),
            user_id: String::new(),
            ack_timeout_ms: 10_000,
            max_send_attempts: 3,
            page_size: 20,
        }
    }
}

impl ClientConfig {
    /// Apply DUGOUT_API_URL, DUGOUT_SOCKET_ADDR and DUGOUT_USER_ID.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Some(url) = lookup("DUGOUT_API_URL") {
            self.api_base_url = url;
        }
        if let Some(addr) = lookup("DUGOUT_SOCKET_ADDR") {
            self.socket_addr = addr;
        }
        if let Some(user) = lookup("DUGOUT_USER_ID") {
            self.user_id = user;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ack_timeout_ms == 0 {
            return Err(ChatError::Config("ack_timeout_ms must be positive".to_string()));
        }
        if self.max_send_attempts == 0 {
            return Err(ChatError::Config("max_send_attempts must be at least 1".to_string()));
        }
        if self.page_size == 0 {
            return Err(ChatError::Config("page_size must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_send_attempts: self.max_send_attempts,
            page_size: self.page_size,
        }
    }
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Use `path` instead of the default config file. Only the first call wins.
pub fn set_config_path_override(path: PathBuf) {
    let _ = CONFIG_PATH_OVERRIDE.set(path);
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| ChatError::Config("Could not determine config directory".to_string()))?
        .join("dugout");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("config.json"))
}

pub fn load_config() -> Result<ClientConfig> {
    load_config_from(&get_config_path()?)
}

pub fn save_config(config: &ClientConfig) -> Result<()> {
    save_config_to(&get_config_path()?, config)
}

/// Read a config file; a missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<ClientConfig> {
    if !path.exists() {
        info!("No config at {}, using defaults", path.display());
        return Ok(ClientConfig::default());
    }

    let contents = fs::read_to_string(path)?;
    let config: ClientConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    info!("Loaded config for {} from {}", config.user_id, path.display());
    Ok(config)
}

pub fn save_config_to(path: &Path, config: &ClientConfig) -> Result<()> {
    config.validate()?;
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;
    info!("Config saved to {}", path.display());
    Ok(())
}
