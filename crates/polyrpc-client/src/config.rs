//! Client configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/polyrpc/config.toml` by default. Durations are milliseconds:
//!
//! ```toml
//! endpoint = "tcp://127.0.0.1:10678"
//! connect_timeout_ms = 5000
//! receive_timeout_ms = 30000
//! remote_idle_timeout_ms = 1000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use polyrpc_protocol::{Endpoint, settings::millis};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// Configuration for a polyrpc client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host to connect to.
    pub endpoint: Endpoint,

    /// Upper bound on establishing the connection.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Option<Duration>,

    /// Upper bound on writing one request.
    #[serde(rename = "send_timeout_ms", with = "millis")]
    pub send_timeout: Option<Duration>,

    /// Upper bound on waiting for one response.
    #[serde(rename = "receive_timeout_ms", with = "millis")]
    pub receive_timeout: Option<Duration>,

    /// The host's idle timeout. A connection found closed after sitting
    /// idle this long is reported as a remote idle timeout.
    #[serde(rename = "remote_idle_timeout_ms", with = "millis")]
    pub remote_idle_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Unix(polyrpc_server::default_socket_path()),
            connect_timeout: Some(Duration::from_secs(5)),
            send_timeout: None,
            receive_timeout: None,
            remote_idle_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration connecting to `endpoint`.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    /// Loads configuration from the default path.
    pub fn load() -> ClientResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("failed to read config: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| ClientError::Config(format!("failed to parse config: {}", e)))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("polyrpc")
    }

    /// Builder: set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Builder: set the send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Builder: set the receive timeout.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    /// Builder: set the host's idle timeout.
    pub fn with_remote_idle_timeout(mut self, timeout: Duration) -> Self {
        self.remote_idle_timeout = Some(timeout);
        self
    }
}
