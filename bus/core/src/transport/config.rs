//! Bus Configuration
//!
//! Which bus to connect to, where its daemon listens, and how long to wait.
//!
//! The bus kind used by [`create_connection`](crate::create_connection) is
//! [`BusConfig::default_bus`]. It is an explicit setting and is never derived
//! from the environment; only addresses and timeouts can be overridden there.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Directory name used under the runtime directories
const BUS_DIR: &str = "busway";

/// Which bus a connection talks to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// System-wide bus shared by all users
    #[default]
    System,
    /// Per-login-session bus
    Session,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::Session => f.write_str("session"),
        }
    }
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(Self::System),
            "session" | "user" => Ok(Self::Session),
            other => Err(format!("Unknown bus kind {other:?} (expected system or session)")),
        }
    }
}

/// Errors loading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config {path:?}: {source}")]
    Io {
        /// Path that was read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid TOML for [`BusConfig`]
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Connection configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Socket of the system bus daemon
    pub system_socket: PathBuf,

    /// Socket of the session bus daemon
    pub session_socket: PathBuf,

    /// Bus used by the connection factories that do not name one
    pub default_bus: BusKind,

    /// Connection timeout in milliseconds (0 = no timeout)
    ///
    /// Covers both the socket connect and the hello handshake.
    pub connect_timeout_ms: u64,

    /// Timeout for name requests and releases in milliseconds (0 = no timeout)
    pub call_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            system_socket: default_system_socket_path(),
            session_socket: default_session_socket_path(),
            default_bus: BusKind::System,
            connect_timeout_ms: 5000,
            call_timeout_ms: 25_000,
        }
    }
}

impl BusConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `BUSWAY_SYSTEM_BUS_SOCKET`: Path to the system bus socket
    /// - `BUSWAY_SESSION_BUS_SOCKET`: Path to the session bus socket
    /// - `BUSWAY_CONNECT_TIMEOUT`: Connection timeout in ms
    /// - `BUSWAY_CALL_TIMEOUT`: Name request timeout in ms
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            system_socket: std::env::var("BUSWAY_SYSTEM_BUS_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(defaults.system_socket),
            session_socket: std::env::var("BUSWAY_SESSION_BUS_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(defaults.session_socket),
            default_bus: defaults.default_bus,
            connect_timeout_ms: std::env::var("BUSWAY_CONNECT_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.connect_timeout_ms),
            call_timeout_ms: std::env::var("BUSWAY_CALL_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.call_timeout_ms),
        }
    }

    /// Parse configuration from TOML; missing keys keep their defaults
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Configuration with both buses at one socket (useful for a private daemon)
    #[must_use]
    pub fn with_socket(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            system_socket: path.clone(),
            session_socket: path,
            ..Default::default()
        }
    }

    /// Socket path for the given bus
    #[must_use]
    pub fn socket_for(&self, bus: BusKind) -> &Path {
        match bus {
            BusKind::System => &self.system_socket,
            BusKind::Session => &self.session_socket,
        }
    }

    /// Connect timeout, `None` when disabled
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    /// Name request timeout, `None` when disabled
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }
}

/// Get the default system bus socket path
#[must_use]
pub fn default_system_socket_path() -> PathBuf {
    PathBuf::from("/run").join(BUS_DIR).join("system_bus_socket")
}

/// Get the default session bus socket path
///
/// Uses XDG_RUNTIME_DIR if available, otherwise /tmp/busway-$UID/
#[must_use]
pub fn default_session_socket_path() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        runtime_dir.join(BUS_DIR).join("session_bus_socket")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/{BUS_DIR}-{uid}/session_bus_socket"))
    }
}
