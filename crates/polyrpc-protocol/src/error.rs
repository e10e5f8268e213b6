//! Protocol error types.

use std::fmt;
use std::io;

use polyrpc_core::{CoreError, FormatError, MetadataError};
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Why a connection stopped carrying messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The stream ended in the middle of a message.
    Unexpected,
    /// ECONNABORTED.
    PeerAborted,
    /// ECONNRESET or a broken pipe.
    PeerReset,
    /// The peer closed between two messages.
    Orderly,
    /// Closed by the remote side after the connection sat idle.
    RemoteIdleTimeout,
    /// The local side already closed the channel.
    Disposed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unexpected => "unexpected",
            Self::PeerAborted => "peer aborted",
            Self::PeerReset => "peer reset",
            Self::Orderly => "orderly close",
            Self::RemoteIdleTimeout => "remote idle timeout",
            Self::Disposed => "disposed",
        })
    }
}

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The connection is gone; never retried.
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: CloseReason },

    /// Connecting or handshaking with the peer failed.
    #[error("failed to open connection to {endpoint}: {source}")]
    ConnectionOpen {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// A declared frame length exceeds the configured maximum.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Connection(#[from] CoreError),

    /// IO error not attributable to a closed connection.
    #[error("IO error: {0}")]
    Io(io::Error),

    /// Operation timed out.
    #[error("timeout during {operation}")]
    Timeout { operation: &'static str },

    #[error("invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                Self::closed(CloseReason::PeerReset)
            }
            io::ErrorKind::ConnectionAborted => Self::closed(CloseReason::PeerAborted),
            io::ErrorKind::UnexpectedEof => Self::closed(CloseReason::Unexpected),
            _ => Self::Io(err),
        }
    }
}

impl ProtocolError {
    /// Creates a connection-closed error.
    pub fn closed(reason: CloseReason) -> Self {
        Self::ConnectionClosed { reason }
    }

    /// Creates an invalid endpoint error.
    pub fn invalid_endpoint(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// The close reason, if this is a connection-closed error.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            Self::ConnectionClosed { reason } => Some(*reason),
            _ => None,
        }
    }

    /// Whether the connection is gone.
    pub fn is_connection_closed(&self) -> bool {
        self.close_reason().is_some()
    }
}
