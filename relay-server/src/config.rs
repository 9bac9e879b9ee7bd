//! Server configuration: listen address, per-server overrides of the
//! protocol's default hash-sync/frame-broadcast intervals, and the snapshot
//! path, loaded (and reloadable) from a JSON file — the ambient-stack
//! counterpart of the reference server's `GameConfig.json`/`reload_config`.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_hash_sync_interval")]
    pub hash_sync_interval: u32,
    #[serde(default = "default_frame_broadcast_interval")]
    pub frame_broadcast_interval: u32,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    /// Instances to spawn at startup: name -> registered playset name. A name
    /// also present in the snapshot's `instances` map is rehydrated from it;
    /// otherwise it starts from the playset's own initial state.
    #[serde(default)]
    pub instances: HashMap<String, String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:9001".to_string()
}

fn default_hash_sync_interval() -> u32 {
    protocol::DEFAULT_HASH_SYNC_INTERVAL
}

fn default_frame_broadcast_interval() -> u32 {
    protocol::DEFAULT_FRAME_BROADCAST_INTERVAL
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("relay-snapshot.json")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            hash_sync_interval: default_hash_sync_interval(),
            frame_broadcast_interval: default_frame_broadcast_interval(),
            snapshot_path: default_snapshot_path(),
            instances: HashMap::new(),
        }
    }
}

/// Loads `path`, falling back to [`ServerConfig::default`] if it doesn't exist yet.
pub async fn load(path: &Path) -> Result<ServerConfig, ConfigError> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = ServerConfig::default();
        assert_eq!(config.hash_sync_interval, protocol::DEFAULT_HASH_SYNC_INTERVAL);
        assert_eq!(config.frame_broadcast_interval, protocol::DEFAULT_FRAME_BROADCAST_INTERVAL);
    }

    #[test]
    fn partial_json_fills_in_the_rest_from_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{"listen_addr":"127.0.0.1:9001"}"#).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9001");
        assert_eq!(config.hash_sync_interval, protocol::DEFAULT_HASH_SYNC_INTERVAL);
        assert!(config.instances.is_empty());
    }

    #[test]
    fn instance_roster_parses_from_json() {
        let config: ServerConfig = serde_json::from_str(r#"{"instances":{"lobby":"dotset"}}"#).unwrap();
        assert_eq!(config.instances.get("lobby").map(String::as_str), Some("dotset"));
    }
}
