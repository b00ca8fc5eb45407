// src/config.rs
use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONFIG_FILE_NAME: &str = "json-rpc-stream.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Notification method that makes the engine re-send every pending request.
    #[serde(default)]
    pub retry_on_method: Option<String>,

    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            retry_on_method: None,
            log_filter: default_log_filter(),
        }
    }
}

impl BridgeConfig {
    /// Reads `RPC_STREAM_RETRY_ON` and `RPC_STREAM_LOG`, after loading `.env` if present.
    pub fn from_env() -> Self {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        BridgeConfig {
            retry_on_method: lookup("RPC_STREAM_RETRY_ON").filter(|method| !method.is_empty()),
            log_filter: lookup("RPC_STREAM_LOG").unwrap_or_else(default_log_filter),
        }
    }
}

pub fn find_config_file() -> Result<PathBuf> {
    let alternative = Path::new("config").join(CONFIG_FILE_NAME);
    let locations = [
        ("Current directory", Path::new(CONFIG_FILE_NAME)),
        ("Current directory (alternative)", alternative.as_path()),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in the current directory, ./config or your home directory",
        CONFIG_FILE_NAME
    ))
}

pub fn load_config(path: &Path) -> Result<BridgeConfig> {
    let config_content = fs::read_to_string(path)
        .context(format!("Failed to read config file at {}", path.display()))?;

    let config: BridgeConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON")?;

    if config.retry_on_method.as_deref() == Some("") {
        return Err(anyhow!("Configuration error: retry_on_method cannot be empty"));
    }

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// File configuration when one can be found, environment otherwise.
pub fn load() -> BridgeConfig {
    match find_config_file().and_then(|path| load_config(&path)) {
        Ok(config) => config,
        Err(e) => {
            debug!("Falling back to environment configuration: {:#}", e);
            BridgeConfig::from_env()
        }
    }
}
