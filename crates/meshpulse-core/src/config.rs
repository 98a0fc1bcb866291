//! Configuration system for Mesh-Pulse.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESH_PULSE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/mesh-pulse/config.toml
//!   3. ~/.config/mesh-pulse/config.toml

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{DEFAULT_BROADCAST_PORT, DEFAULT_TRANSFER_PORT};

/// Secret used when none is configured. Only interoperates with nodes
/// that also run unconfigured.
pub const DEFAULT_SECRET: &str = "mesh-pulse-default-key";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub transfer: TransferConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Display name announced to peers. Empty = hostname.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port for discovery beacons.
    pub broadcast_port: u16,
    /// TCP port for transfers.
    pub transfer_port: u16,
    /// Destination address for beacons.
    pub broadcast_addr: IpAddr,
    /// Local address both listeners bind to.
    pub bind_addr: IpAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub announce_interval_secs: u64,
    /// Silence after which a peer is reported STALE.
    pub stale_after_secs: u64,
    /// Silence after which a peer is removed.
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Directory completed downloads are written to.
    pub receive_dir: PathBuf,
    /// If false, every inbound header is rejected as declined.
    pub accept_incoming: bool,
    pub handshake_timeout_secs: u64,
    /// Longest a single frame read or write may stall.
    pub stall_timeout_secs: u64,
    pub max_file_bytes: u64,
    /// Minimum spacing of progress events per session.
    pub progress_interval_ms: u64,
    /// How long a finished session stays queryable.
    pub session_grace_secs: u64,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Shared secret. Never logged.
    pub secret: String,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("secret", &"<redacted>")
            .finish()
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            broadcast_port: DEFAULT_BROADCAST_PORT,
            transfer_port: DEFAULT_TRANSFER_PORT,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            announce_interval_secs: 2,
            stale_after_secs: 6,
            ttl_secs: 10,
            sweep_interval_secs: 1,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            receive_dir: data_dir().join("received"),
            accept_incoming: true,
            handshake_timeout_secs: 5,
            stall_timeout_secs: 30,
            max_file_bytes: 1 << 40,
            progress_interval_ms: 100,
            session_grace_secs: 30,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret: DEFAULT_SECRET.to_string(),
        }
    }
}

// ── Durations ─────────────────────────────────────────────────────────────────

impl DiscoveryConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl TransferConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn session_grace(&self) -> Duration {
        Duration::from_secs(self.session_grace_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("mesh-pulse")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("mesh-pulse")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeshConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MESH_PULSE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    ///
    /// The default secret is left out of the written file so that it never
    /// looks like a deliberately configured key.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        write_default_to(&path)?;
        Ok(path)
    }

    /// Display name to announce, falling back to the given hostname.
    pub fn display_name(&self, hostname: &str) -> String {
        if self.node.name.trim().is_empty() {
            hostname.to_string()
        } else {
            self.node.name.trim().to_string()
        }
    }

    /// Reject settings the services cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.broadcast_port == 0 {
            return Err(ConfigError::Invalid("network.broadcast_port must not be 0"));
        }
        if self.network.transfer_port == 0 {
            return Err(ConfigError::Invalid("network.transfer_port must not be 0"));
        }
        let d = &self.discovery;
        if d.announce_interval_secs == 0 || d.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("discovery intervals must be non-zero"));
        }
        if d.stale_after_secs >= d.ttl_secs {
            return Err(ConfigError::Invalid(
                "discovery.stale_after_secs must be below discovery.ttl_secs",
            ));
        }
        let t = &self.transfer;
        if t.handshake_timeout_secs == 0 || t.stall_timeout_secs == 0 {
            return Err(ConfigError::Invalid("transfer timeouts must be non-zero"));
        }
        if self.security.secret.is_empty() {
            return Err(ConfigError::Invalid("security.secret must not be empty"));
        }
        Ok(())
    }

    /// Apply MESH_PULSE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(p) = lookup("MESH_PULSE_BCAST_PORT").and_then(|v| v.parse().ok()) {
            self.network.broadcast_port = p;
        }
        if let Some(p) = lookup("MESH_PULSE_XFER_PORT").and_then(|v| v.parse().ok()) {
            self.network.transfer_port = p;
        }
        if let Some(a) = lookup("MESH_PULSE_BROADCAST_ADDR").and_then(|v| v.parse().ok()) {
            self.network.broadcast_addr = a;
        }
        if let Some(v) = lookup("MESH_PULSE_KEY") {
            self.security.secret = v;
        }
        if let Some(v) = lookup("MESH_PULSE_NAME") {
            self.node.name = v;
        }
        if let Some(v) = lookup("MESH_PULSE_RECEIVE_DIR") {
            self.transfer.receive_dir = PathBuf::from(v);
        }
    }
}

fn write_default_to(path: &std::path::Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
    }
    let mut defaults = MeshConfig::default();
    defaults.security.secret.clear();
    let mut text = toml::to_string_pretty(&defaults).map_err(ConfigError::SerializeFailed)?;
    text = text.replace("secret = \"\"", "# secret = \"...\"  (or set MESH_PULSE_KEY)");
    std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
}
