//! Wire plumbing for polyrpc: byte channels, endpoint URLs and the
//! length-prefixed envelope protocol.
//!
//! # Protocol overview
//!
//! A message is sent as two frames, each `[u32 big-endian length][bytes]`:
//! first the [`Header`](polyrpc_core::Header) naming the payload's 16-bit
//! type identifier, then the payload itself. Bytes are produced by the
//! session's [`Formatter`](polyrpc_core::Formatter).
//!
//! ```rust,no_run
//! # async fn demo(
//! #     channel: &mut dyn polyrpc_protocol::Channel,
//! #     metadata: &polyrpc_core::MessageMetadata<polyrpc_core::JsonFormatter>,
//! # ) -> polyrpc_protocol::ProtocolResult<()> {
//! use polyrpc_core::JsonFormatter;
//! use polyrpc_protocol::Messenger;
//!
//! let mut messenger = Messenger::<JsonFormatter>::default();
//! let (message_id, request) = messenger.receive(channel, metadata).await?;
//! # let _ = (message_id, request);
//! # Ok(())
//! # }
//! ```

mod channel;
mod endpoint;
mod error;
mod framing;
pub mod settings;

pub use channel::{Channel, StreamChannel};
pub use endpoint::Endpoint;
pub use error::{CloseReason, ProtocolError, ProtocolResult};
pub use framing::{
    DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_MESSAGE_SIZE, FrameBuffer, LENGTH_PREFIX, Messenger,
};
pub use settings::TransportSettings;
