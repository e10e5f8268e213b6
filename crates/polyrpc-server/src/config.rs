//! Host configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use polyrpc_core::TimerConfig;
use polyrpc_protocol::{DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_MESSAGE_SIZE, Endpoint, TransportSettings};
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Host configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Where to listen.
    pub endpoint: Endpoint,

    /// Buffer sizes and client time limits.
    pub transport: TransportSettings,

    /// Maximum concurrent sessions; further clients wait in the backlog.
    pub max_connections: usize,

    /// Whether to remove a stale Unix socket on startup.
    pub cleanup_stale_socket: bool,

    /// Initial per-session receive buffer capacity.
    pub initial_buffer_capacity: usize,

    /// Largest accepted frame.
    pub max_message_size: usize,

    /// Timeout wheel tick, in milliseconds.
    pub timer_tick_ms: u64,

    /// Timeout wheel size.
    pub timer_ticks_per_wheel: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Unix(default_socket_path()),
            transport: TransportSettings::default(),
            max_connections: 100,
            cleanup_stale_socket: true,
            initial_buffer_capacity: DEFAULT_INITIAL_CAPACITY,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            timer_tick_ms: 100,
            timer_ticks_per_wheel: 512,
        }
    }
}

impl HostConfig {
    /// Creates a host configuration listening on `endpoint`.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    /// Loads a configuration from a TOML file.
    pub fn load_from(path: &Path) -> ServerResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServerError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&content)
            .map_err(|e| ServerError::config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Builder: set transport settings.
    pub fn with_transport(mut self, transport: TransportSettings) -> Self {
        self.transport = transport;
        self
    }

    /// Builder: set the idle-client timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.transport.idle_timeout = Some(timeout);
        self
    }

    /// Builder: set max connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder: set cleanup stale socket.
    pub fn with_cleanup_stale_socket(mut self, cleanup: bool) -> Self {
        self.cleanup_stale_socket = cleanup;
        self
    }

    /// Builder: set the frame size limit.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Builder: set the timeout wheel tick.
    pub fn with_timer_tick(mut self, tick: Duration) -> Self {
        self.timer_tick_ms = tick.as_millis().max(1) as u64;
        self
    }

    /// Timeout wheel configuration derived from this host's settings.
    pub fn timer_config(&self) -> TimerConfig {
        TimerConfig {
            tick_duration: Duration::from_millis(self.timer_tick_ms.max(1)),
            ticks_per_wheel: self.timer_ticks_per_wheel,
            max_pending_timeouts: None,
            thread_name: "polyrpc-timer".to_string(),
        }
    }
}

/// Returns the default socket path.
///
/// Uses `$XDG_RUNTIME_DIR/polyrpc.sock` if available,
/// otherwise falls back to `/tmp/polyrpc-$UID.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("polyrpc.sock")
    } else {
        #[cfg(unix)]
        let uid = unsafe { libc::getuid() };
        #[cfg(not(unix))]
        let uid = 0;
        PathBuf::from(format!("/tmp/polyrpc-{uid}.sock"))
    }
}
