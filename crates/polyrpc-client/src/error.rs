//! Client error types.

use std::fmt;

use polyrpc_core::{ContractError, MetadataError};
use polyrpc_protocol::{CloseReason, ProtocolError};
use polyrpc_server::ServerError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug)]
pub enum ClientError {
    /// Configuration error.
    Config(String),
    /// IO error.
    Io(std::io::Error),
    /// Connecting to the host failed.
    Connection(String),
    /// The connection was closed.
    Closed(CloseReason),
    /// No connection is established.
    NotConnected,
    /// A contract failed validation or does not declare the request.
    Contract(String),
    /// Framing, encoding or an unexpected response.
    Protocol(String),
    /// Sending or receiving took too long.
    Timeout(String),
    /// The local host failed to start or serve.
    Host(String),
}

impl ClientError {
    /// Creates a connection-closed error.
    pub fn closed(reason: CloseReason) -> Self {
        Self::Closed(reason)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Creates a contract error.
    pub fn contract(message: impl Into<String>) -> Self {
        Self::Contract(message.into())
    }

    /// Why the connection closed, if it did.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            Self::Closed(reason) => Some(*reason),
            _ => None,
        }
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Connection(msg) => write!(f, "connection error: {}", msg),
            Self::Closed(reason) => write!(f, "connection closed: {}", reason),
            Self::NotConnected => f.write_str("not connected"),
            Self::Contract(msg) => write!(f, "contract error: {}", msg),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Timeout(msg) => write!(f, "timeout: {}", msg),
            Self::Host(msg) => write!(f, "host error: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::ConnectionClosed { reason } => Self::Closed(reason),
            ProtocolError::ConnectionOpen { .. } | ProtocolError::InvalidEndpoint { .. } => {
                Self::Connection(err.to_string())
            }
            ProtocolError::Timeout { operation } => Self::Timeout(operation.to_string()),
            ProtocolError::Io(err) => Self::Io(err),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<ServerError> for ClientError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Config { message } => Self::Config(message),
            ServerError::Io(err) => Self::Io(err),
            other => Self::Host(other.to_string()),
        }
    }
}

impl From<ContractError> for ClientError {
    fn from(err: ContractError) -> Self {
        Self::Contract(err.to_string())
    }
}

impl From<MetadataError> for ClientError {
    fn from(err: MetadataError) -> Self {
        Self::Protocol(err.to_string())
    }
}
