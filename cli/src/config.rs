// Configuration management for the meshrelay CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/meshrelay/config.json
// - Linux: ~/.config/meshrelay/config.json
// - Windows: %APPDATA%\meshrelay\config.json
//
// Command-line flags override anything read from here.

use anyhow::{Context, Result};
use meshrelay_core::{parse_peer_list, LinkConfig, PeerAddr, ReconnectPolicy, DEFAULT_RELAY_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bridge upstream when neither the flag nor the config names one
pub const DEFAULT_UPSTREAM: &str = "127.0.0.1:7777";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port the relay listens on
    pub listen_port: u16,

    /// Peers the relay keeps connected (`host[:port]`)
    pub forward_to: Vec<String>,

    /// Upstream peer for bridge mode (`DEFAULT_UPSTREAM` when unset)
    pub upstream: Option<String>,

    /// Application id baked into bridge message ids
    pub application_id: u16,

    /// Drop envelopes whose id was seen among the last N (relay only)
    pub dedup_capacity: Option<usize>,

    /// Log directory for the daily rolling file; stderr only when unset
    pub log_dir: Option<String>,

    pub network: NetworkConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Relay re-dial interval in milliseconds
    pub relay_reconnect_ms: u64,

    /// Bridge re-dial interval in milliseconds
    pub bridge_reconnect_ms: u64,

    /// Socket write timeout in seconds (none when unset)
    pub write_timeout_secs: Option<u64>,

    /// Dial timeout in seconds (none when unset)
    pub connect_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_RELAY_PORT,
            forward_to: Vec::new(),
            upstream: None,
            application_id: meshrelay_core::relay::DEFAULT_APPLICATION_ID,
            dedup_capacity: None,
            log_dir: None,
            network: NetworkConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            relay_reconnect_ms: 2000,
            bridge_reconnect_ms: 500,
            write_timeout_secs: None,
            connect_timeout_secs: None,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("meshrelay"))
    }

    /// Get the default config file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Resolve `explicit` or fall back to the default path
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        match explicit {
            Some(path) => Ok(path.to_path_buf()),
            None => Self::default_path(),
        }
    }

    /// Load config from `path`; defaults when the file does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Save config to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Parsed `forward_to` entries, port defaulting to `listen_port`.
    /// Each entry may itself be a comma-separated list.
    pub fn forward_peers(&self) -> Result<Vec<PeerAddr>> {
        let list = self.forward_to.join(",");
        parse_peer_list(&list, self.listen_port).with_context(|| format!("Bad forward_to list '{}'", list))
    }

    /// The bridge upstream, port defaulting to `listen_port`
    pub fn upstream_peer(&self) -> Result<PeerAddr> {
        let upstream = self.upstream.as_deref().unwrap_or(DEFAULT_UPSTREAM);
        PeerAddr::parse_with_default(upstream, self.listen_port)
            .with_context(|| format!("Bad upstream '{}'", upstream))
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            write_timeout: self.network.write_timeout_secs.map(Duration::from_secs),
            connect_timeout: self.network.connect_timeout_secs.map(Duration::from_secs),
            ..LinkConfig::default()
        }
    }

    pub fn relay_reconnect(&self) -> ReconnectPolicy {
        ReconnectPolicy::Fixed(Duration::from_millis(self.network.relay_reconnect_ms))
    }

    pub fn bridge_reconnect(&self) -> ReconnectPolicy {
        ReconnectPolicy::Fixed(Duration::from_millis(self.network.bridge_reconnect_ms))
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let or_none = |v: Option<String>| v.unwrap_or_else(|| "(none)".to_string());
        vec![
            ("listen_port".to_string(), self.listen_port.to_string()),
            ("forward_to".to_string(), or_none(Some(self.forward_to.join(",")).filter(|s| !s.is_empty()))),
            ("upstream".to_string(), self.upstream.clone().unwrap_or_else(|| DEFAULT_UPSTREAM.to_string())),
            ("application_id".to_string(), self.application_id.to_string()),
            ("dedup_capacity".to_string(), or_none(self.dedup_capacity.map(|n| n.to_string()))),
            ("log_dir".to_string(), or_none(self.log_dir.clone())),
            ("relay_reconnect".to_string(), format!("{}ms", self.network.relay_reconnect_ms)),
            ("bridge_reconnect".to_string(), format!("{}ms", self.network.bridge_reconnect_ms)),
            ("write_timeout".to_string(), or_none(self.network.write_timeout_secs.map(|s| format!("{s}s")))),
            ("connect_timeout".to_string(), or_none(self.network.connect_timeout_secs.map(|s| format!("{s}s")))),
        ]
    }
}
