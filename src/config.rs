use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::directory::DirectoryConfig;
use crate::discovery::{DiscoveryConfig, RefreshConfig};
use crate::store::StoreConfig;

/// Top-level configuration, stored as camelCase JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Get the canonical config file path (~/.idbridge/config.json)
pub fn config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".idbridge").join("config.json"))
}

/// Load configuration from ~/.idbridge/config.json
pub fn load_config() -> Result<BridgeConfig, String> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<BridgeConfig, String> {
    if !path.exists() {
        return Err(format!(
            "Config file not found at {}. Create it with: {{ \"directory\": {{ \"baseUrl\": \"https://directory.example.org/api/v1\" }} }}",
            path.display()
        ));
    }

    let content = fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;

    let config: BridgeConfig =
        serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))?;

    if config.directory.base_url.trim().is_empty() {
        return Err("directory.baseUrl is required".to_string());
    }
    if config.refresh.period_secs == 0 || config.refresh.error_retry_secs == 0 {
        return Err("refresh.periodSecs and refresh.errorRetrySecs must be positive".to_string());
    }

    Ok(config)
}
