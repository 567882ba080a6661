//! Node configuration
//!
//! - Stored in ~/.datamesh/config.json
//! - Every field has a default, so a partial or missing file is fine
//! - CLI flags override whatever is loaded here

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONTROLLER_PORT: u16 = 5000;
pub const DEFAULT_BROADCAST_PORT: u16 = 5001;

/// Runtime settings for a mesh node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub controller_port: u16,
    pub broadcast_port: u16,
    pub broadcast_interval_secs: u64,
    /// Interfaces probed for addresses, in priority order
    pub interfaces: Vec<String>,
    /// Overrides the derived broadcast address
    pub broadcast_addr: Option<Ipv4Addr>,
    pub max_request_bytes: usize,
    /// Cap on timer callbacks running at once
    pub timer_concurrency: usize,
    pub worker_period_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            controller_port: DEFAULT_CONTROLLER_PORT,
            broadcast_port: DEFAULT_BROADCAST_PORT,
            broadcast_interval_secs: 5,
            interfaces: vec!["eth0".to_string(), "wlan0".to_string(), "wlo1".to_string()],
            broadcast_addr: None,
            max_request_bytes: 64 * 1024,
            timer_concurrency: 64,
            worker_period_secs: 5,
        }
    }
}

impl NodeConfig {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs.max(1))
    }

    pub fn worker_period(&self) -> Duration {
        Duration::from_secs(self.worker_period_secs.max(1))
    }
}

/// Get config file path (~/.datamesh/config.json)
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".datamesh")
        .join("config.json")
}

/// Load config from `path`, or from the default location.
/// A missing file yields defaults.
pub fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(get_config_path);
    if !path.exists() {
        return Ok(NodeConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: NodeConfig = serde_json::from_str(&content)?;
    tracing::debug!("Config loaded from {:?}", path);
    Ok(config)
}

/// Save config to `path`
pub fn save_config(config: &NodeConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;

    tracing::info!("Config saved to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("nope.json"))).unwrap();
        assert_eq!(config.controller_port, 5000);
        assert_eq!(config.broadcast_port, 5001);
        assert_eq!(config.broadcast_interval(), Duration::from_secs(5));
        assert_eq!(config.interfaces, vec!["eth0", "wlan0", "wlo1"]);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"controller_port": 6000, "broadcast_addr": "10.255.255.255"}"#)
            .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.controller_port, 6000);
        assert_eq!(config.broadcast_port, 5001);
        assert_eq!(config.broadcast_addr, Some(Ipv4Addr::new(10, 255, 255, 255)));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = NodeConfig {
            worker_period_secs: 2,
            ..NodeConfig::default()
        };

        save_config(&config, &path).unwrap();
        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.worker_period(), Duration::from_secs(2));
    }
}
