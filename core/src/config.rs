//! Node configuration
//!
//! Loaded from an optional TOML file; every field has a default so an empty
//! file (or none at all) yields a runnable node.

use crate::protocol::codec::DEFAULT_MAX_FRAME_LEN;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8089;

/// Default directory holding the node key
pub const DEFAULT_KEY_DIR: &str = ".kvstoreconfig";

/// Anti-entropy tuning
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiEntropyConfig {
    /// Seconds a round may wait for its missing operations before retrying
    pub round_timeout_secs: u64,

    /// `NEED` re-sends before a round is abandoned
    pub max_round_retries: u32,

    /// Interval of the expiry sweep
    pub sweep_interval_ms: u64,

    /// Answer `NEED` from every pooled operation, not only the link snapshot
    pub serve_needs_from_pool: bool,
}

impl Default for AntiEntropyConfig {
    fn default() -> Self {
        Self {
            round_timeout_secs: 10,
            max_round_retries: 3,
            sweep_interval_ms: 1000,
            serve_needs_from_pool: false,
        }
    }
}

impl AntiEntropyConfig {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Node configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the listener binds to
    pub listen: SocketAddr,

    /// Host announced to peers in `CON?`
    pub advertise_host: String,

    /// Directory holding `node.key`
    pub key_dir: PathBuf,

    /// `host:port` peers dialed on startup
    pub peers: Vec<String>,

    /// Largest accepted frame body, in bytes
    pub max_frame_len: usize,

    pub anti_entropy: AntiEntropyConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            advertise_host: "127.0.0.1".to_string(),
            key_dir: PathBuf::from(DEFAULT_KEY_DIR),
            peers: Vec::new(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            anti_entropy: AntiEntropyConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.advertise_host.is_empty() {
            return Err(Error::Config("advertise_host cannot be empty".to_string()));
        }
        if self.max_frame_len == 0 || self.max_frame_len > u32::MAX as usize {
            return Err(Error::Config(format!(
                "max_frame_len must be between 1 and {}",
                u32::MAX
            )));
        }
        if self.anti_entropy.sweep_interval_ms == 0 {
            return Err(Error::Config("sweep_interval_ms must be positive".to_string()));
        }
        for peer in &self.peers {
            if peer.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok()).is_none() {
                return Err(Error::Config(format!("peer {:?} is not host:port", peer)));
            }
        }
        Ok(())
    }

    /// Path of the node key file
    pub fn key_path(&self) -> PathBuf {
        self.key_dir.join("node.key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::from_toml_str("").unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.listen.port(), DEFAULT_PORT);
        assert_eq!(config.key_path(), PathBuf::from(".kvstoreconfig/node.key"));
        assert_eq!(config.anti_entropy.round_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_overrides() {
        let config = NodeConfig::from_toml_str(
            r#"
            listen = "127.0.0.1:9000"
            peers = ["10.0.0.2:8089"]

            [anti_entropy]
            max_round_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.peers, vec!["10.0.0.2:8089".to_string()]);
        assert_eq!(config.anti_entropy.max_round_retries, 5);
        assert_eq!(config.anti_entropy.sweep_interval_ms, 1000);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            NodeConfig::from_toml_str("peers = [\"nohost\"]"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml_str("listen = 12"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "advertise_host = \"node-a\"").unwrap();
        assert_eq!(NodeConfig::load(&path).unwrap().advertise_host, "node-a");
        assert!(NodeConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
