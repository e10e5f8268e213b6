//! Transport settings shared by hosts and clients.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Buffer sizes and I/O time limits of one transport.
///
/// Durations are written as milliseconds in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Capacity of the buffered reader wrapped around each stream.
    pub receive_buffer_size: usize,

    /// Capacity of the buffered writer wrapped around each stream.
    pub send_buffer_size: usize,

    /// A host disposes sessions that send nothing for this long.
    #[serde(rename = "idle_timeout_ms", with = "millis")]
    pub idle_timeout: Option<Duration>,

    /// Upper bound on receiving one complete request once it started.
    #[serde(rename = "client_receive_timeout_ms", with = "millis")]
    pub client_receive_timeout: Option<Duration>,

    /// Upper bound on sending one complete response.
    #[serde(rename = "client_send_timeout_ms", with = "millis")]
    pub client_send_timeout: Option<Duration>,

    /// Set TCP_NODELAY on TCP streams.
    pub no_delay: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            receive_buffer_size: 8 * 1024,
            send_buffer_size: 8 * 1024,
            idle_timeout: None,
            client_receive_timeout: None,
            client_send_timeout: None,
            no_delay: true,
        }
    }
}

impl TransportSettings {
    /// Builder: set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Builder: set the per-request receive timeout.
    pub fn with_client_receive_timeout(mut self, timeout: Duration) -> Self {
        self.client_receive_timeout = Some(timeout);
        self
    }

    /// Builder: set the per-response send timeout.
    pub fn with_client_send_timeout(mut self, timeout: Duration) -> Self {
        self.client_send_timeout = Some(timeout);
        self
    }

    /// Builder: set both buffer sizes.
    pub fn with_buffer_sizes(mut self, receive: usize, send: usize) -> Self {
        self.receive_buffer_size = receive;
        self.send_buffer_size = send;
        self
    }

    /// Builder: toggle TCP_NODELAY.
    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }
}

/// `Option<Duration>` as an optional millisecond count.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
