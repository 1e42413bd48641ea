//! TOML-backed configuration for connections, the server listener, and
//! discovery.
//!
//! Every field has a serde default, so an empty file (or a missing one, see
//! [`NetConfig::load`]) yields the stock configuration:
//!
//! ```toml
//! [connection]
//! address_family = "ipv4"
//! no_delay = false
//! auto_start_receiver = true
//! receive_buffer_size = 1024
//!
//! [server]
//! listen_backlog = 10
//!
//! [discovery]
//! port = 4356
//! application_id = 42
//! approval_number = 111
//! message_data = 0
//! log_validation_issues = false
//! poll_interval_ms = 500
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use lanlink_core::protocol::discovery::{
    DEFAULT_APPLICATION_ID, DEFAULT_APPROVAL_NUMBER, DEFAULT_DISCOVERY_PORT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Address family ────────────────────────────────────────────────────────────

/// IP family used for listener address resolution and discovery sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn unspecified(self) -> IpAddr {
        match self {
            AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => f.write_str("IPv4"),
            AddressFamily::Ipv6 => f.write_str("IPv6"),
        }
    }
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NetConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Per-connection settings shared by both connection managers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Preferred family when the listener address is resolved automatically.
    #[serde(default)]
    pub address_family: AddressFamily,
    /// Disables Nagle's algorithm on new sockets.
    #[serde(default)]
    pub no_delay: bool,
    /// Start the receive worker as soon as a connection is added.
    #[serde(default = "default_true")]
    pub auto_start_receiver: bool,
    /// Size of the buffer each receive call reads into.
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,
    /// Largest payload a peer may declare before the connection is dropped.
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    #[serde(default = "default_application_id")]
    pub application_id: i32,
    #[serde(default = "default_approval_number")]
    pub approval_number: i32,
    /// Payload stamped on outgoing datagrams, usually a TCP port.
    #[serde(default)]
    pub message_data: i32,
    /// Report rejected datagrams through the log sink.
    #[serde(default)]
    pub log_validation_issues: bool,
    /// How often the response worker re-checks its running flag.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl DiscoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_receive_buffer_size() -> usize {
    1024
}
fn default_max_payload_size() -> usize {
    i32::MAX as usize
}
fn default_listen_backlog() -> i32 {
    10
}
fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}
fn default_application_id() -> i32 {
    DEFAULT_APPLICATION_ID
}
fn default_approval_number() -> i32 {
    DEFAULT_APPROVAL_NUMBER
}
fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address_family: AddressFamily::default(),
            no_delay: false,
            auto_start_receiver: default_true(),
            receive_buffer_size: default_receive_buffer_size(),
            max_payload_size: default_max_payload_size(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_backlog: default_listen_backlog(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: default_discovery_port(),
            application_id: default_application_id(),
            approval_number: default_approval_number(),
            message_data: 0,
            log_validation_issues: false,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

// ── Persistence ───────────────────────────────────────────────────────────────

impl NetConfig {
    /// Loads a config file, returning `NetConfig::default()` if it does not
    /// exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] for file-system errors other than "not
    /// found", and [`ConfigError::Parse`] if the TOML is malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Writes the config to `path`, creating parent directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
