//! Server error types.

use std::io;

use polyrpc_core::{ContractError, DispatchError, MetadataError, ProviderError, TimerError};
use polyrpc_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors raised by the host, its listeners and its sessions.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (socket, file, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (framing, encoding, closed connection, etc.).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("timer error: {0}")]
    Timer(#[from] TimerError),

    /// `start` was called before any contract was added.
    #[error("no contract operations registered")]
    NoOperations,

    /// `start` or `add_contract` after the host started.
    #[error("host is already started")]
    AlreadyStarted,

    /// A contract was added without a factory for its implementation.
    #[error("no implementor registered for contract `{contract}`")]
    MissingImplementor { contract: &'static str },

    /// The listener shut down underneath the accept loop.
    #[error("listener stopped")]
    ListenerStopped,

    /// Socket path already in use.
    #[error("socket path already in use: {path}")]
    SocketInUse { path: String },

    /// Socket path parent directory does not exist.
    #[error("socket path parent directory does not exist: {path}")]
    SocketPathInvalid { path: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a socket in use error.
    pub fn socket_in_use(path: impl Into<String>) -> Self {
        Self::SocketInUse { path: path.into() }
    }

    /// Creates a socket path invalid error.
    pub fn socket_path_invalid(path: impl Into<String>) -> Self {
        Self::SocketPathInvalid { path: path.into() }
    }

    /// Whether this error only means the peer went away.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::Protocol(e) if e.is_connection_closed())
    }
}
