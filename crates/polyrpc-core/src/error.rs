//! Core error types.

use std::fmt;

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::message::MessageId;

/// Error type returned by contract handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for connection state operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Result type for metadata and router operations.
pub type MetadataResult<T> = Result<T, MetadataError>;

/// Result type for contract inspection.
pub type ContractResult<T> = Result<T, ContractError>;

/// Result type for formatter operations.
pub type FormatResult<T> = Result<T, FormatError>;

/// Result type for dispatching.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Result type for implementor resolution.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Result type for timer operations.
pub type TimerResult<T> = Result<T, TimerError>;

/// Errors raised by the connection model.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Addresses were requested before the connection was opened.
    #[error("connection is not opened yet")]
    NotOpened,

    /// A transition that would move the connection backwards.
    #[error("invalid connection transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Errors raised by a [`Formatter`](crate::Formatter).
#[derive(Debug, Error)]
pub enum FormatError {
    /// Input ended in the middle of an object.
    #[error("end of data")]
    EndOfData,

    /// Input did not match the expected shape.
    #[error("unexpected data: {0}")]
    UnexpectedData(String),

    /// The value handed to an encoder had a different type than registered.
    #[error("type mismatch: expected {expected}")]
    TypeMismatch { expected: &'static str },
}

/// Errors raised by message metadata and the router.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// `build` was called a second time.
    #[error("{what} is already built")]
    AlreadyBuilt { what: &'static str },

    /// A lookup happened before `build`.
    #[error("{what} is not built")]
    NotBuilt { what: &'static str },

    /// `build` was called with no operations.
    #[error("cannot build {what} from an empty operation set")]
    Empty { what: &'static str },

    /// No message type is registered for the identifier.
    #[error("missing metadata for message id {id}")]
    MissingId { id: MessageId },

    /// The message type was never registered.
    #[error("missing metadata for message type {type_name}")]
    MissingType { type_name: String },

    /// No operation handles the request identifier.
    #[error("no operation is routed for request id {id}")]
    NoRoute { id: MessageId },

    /// Two distinct types claim the same identifier.
    #[error("message id {id} is claimed by both {first} and {second}")]
    Collision {
        id: MessageId,
        first: &'static str,
        second: &'static str,
    },
}

/// A single problem found while inspecting a contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    /// The contract declares nothing callable.
    #[error("contract declares no operations")]
    NoOperations,

    /// The message type has no name to identify it with.
    #[error("message type {type_name} has no identification")]
    MissingIdentification { type_name: &'static str },

    /// Two message types resolve to the same identifier.
    #[error("message id {id} is claimed by both {first} and {second}")]
    IdCollision {
        id: MessageId,
        first: &'static str,
        second: &'static str,
    },

    /// Two operations accept the same request type.
    #[error("operations `{first}` and `{second}` both accept {request}")]
    AmbiguousRequest {
        request: &'static str,
        first: &'static str,
        second: &'static str,
    },
}

/// Contract validation failure carrying every violation found.
#[derive(Debug, Error)]
pub enum ContractError {
    /// The contract failed validation.
    #[error("contract `{contract}` is invalid: {}", Violations(.violations))]
    Invalid {
        contract: &'static str,
        violations: Vec<Violation>,
    },
}

impl ContractError {
    /// Returns the violations found during inspection.
    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Invalid { violations, .. } => violations,
        }
    }
}

struct Violations<'a>(&'a [Violation]);

impl fmt::Display for Violations<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, violation) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

/// Errors raised while dispatching a request to its handler.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The resolved implementor is not the operation's contract type.
    #[error("implementor is not a {expected}")]
    ImplementorMismatch { expected: &'static str },

    /// The request object is not the operation's request type.
    #[error("request is not a {expected}")]
    RequestMismatch { expected: &'static str },

    /// The handler itself failed.
    #[error("handler `{operation}` failed: {source}")]
    Handler {
        operation: &'static str,
        #[source]
        source: BoxError,
    },
}

/// Errors raised by the per-session implementor provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// `operation_started` was called while a scope was still open.
    #[error("previous operation scope was not finished")]
    ScopeAlreadyOpen,

    /// A scope operation happened with no open scope.
    #[error("no operation scope is open")]
    NoScope,

    /// `resolve` was called before `session_started`.
    #[error("no connection is bound to the provider")]
    NoSession,

    /// No factory is registered for the contract.
    #[error("no implementor registered for contract `{contract}`")]
    NotRegistered { contract: &'static str },
}

/// Errors raised by the timeout wheel.
#[derive(Debug, Error)]
pub enum TimerError {
    /// The timer was stopped and cannot accept new timeouts.
    #[error("timer is stopped")]
    Stopped,

    /// `stop` was called from a timer task.
    #[error("timer cannot be stopped from its own worker thread")]
    StopFromWorker,

    /// Too many timeouts are waiting to fire.
    #[error("too many pending timeouts: {pending} (max: {max})")]
    TooManyPending { pending: usize, max: usize },

    /// Invalid timer configuration.
    #[error("invalid timer configuration: {0}")]
    Config(String),

    /// The worker thread could not be spawned.
    #[error("failed to spawn timer thread: {0}")]
    Spawn(#[from] std::io::Error),
}
