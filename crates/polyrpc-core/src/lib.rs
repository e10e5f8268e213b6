//! Core of polyrpc: message identity, contracts, metadata, routing, dispatch,
//! per-request implementor scopes and the hashed-wheel timeout scheduler.

pub mod connection;
pub mod contract;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod message;
pub mod metadata;
pub mod provider;
pub mod router;
pub mod timer;
pub mod tracing;

pub use connection::{Address, Connection, ConnectionState};
pub use contract::{
    Contract, ContractInfo, HandlerFuture, Implementor, MessageCodec, Operation, OperationSet,
    inspect,
};
pub use dispatch::Dispatcher;
pub use error::{
    BoxError, ContractError, ContractResult, CoreError, CoreResult, DispatchError, DispatchResult,
    FormatError, FormatResult, MetadataError, MetadataResult, ProviderError, ProviderResult,
    TimerError, TimerResult, Violation,
};
pub use format::{Formatter, JsonFormatter};
pub use message::{
    AnyMessage, HEADER_ID, Header, Message, MessageId, MessageInfo, derive_message_id, message_id,
};
pub use metadata::MessageMetadata;
pub use provider::{ImplementorProvider, ImplementorRegistry};
pub use router::Router;
pub use timer::{HashedWheelTimer, Timeout, TimeoutState, TimerConfig};
pub use self::tracing::{LogFormat, TracingConfig, TracingError, init_tracing};
