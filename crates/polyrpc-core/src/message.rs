//! Message types and wire identifiers.
//!
//! Every payload that crosses the wire is a [`Message`]. On the wire a
//! message is named by a 16-bit [`MessageId`], either declared explicitly
//! through [`Message::ID`] or derived from [`Message::NAME`].

use std::any::{Any, TypeId};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 16-bit identifier used on the wire in place of a type name.
pub type MessageId = u16;

/// Identifier reserved for the envelope [`Header`].
pub const HEADER_ID: MessageId = 0;

/// A type-erased message travelling through the session loop.
pub type AnyMessage = Box<dyn Any + Send>;

/// A request or response payload.
///
/// ```rust
/// use polyrpc_core::Message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Ping;
///
/// impl Message for Ping {
///     const NAME: &'static str = "demo.Ping";
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    /// Stable name of the message; the fallback identifier is derived from it.
    const NAME: &'static str;

    /// Explicit wire identifier, if the message declares one.
    const ID: Option<MessageId> = None;
}

/// Envelope header preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Identifier of the payload that follows.
    pub message_id: MessageId,
}

impl Header {
    /// Creates a header announcing the given payload identifier.
    pub fn new(message_id: MessageId) -> Self {
        Self { message_id }
    }
}

impl Message for Header {
    const NAME: &'static str = "polyrpc.Header";
    const ID: Option<MessageId> = Some(HEADER_ID);
}

/// Derives a wire identifier from a message name.
///
/// The first two bytes of the SHA-256 digest of the name, big-endian.
/// Distinct names may collide; collisions are rejected at registration.
pub fn derive_message_id(name: &str) -> MessageId {
    let digest = Sha256::digest(name.as_bytes());
    u16::from_be_bytes([digest[0], digest[1]])
}

/// Returns the wire identifier of `M`.
pub fn message_id<M: Message>() -> MessageId {
    M::ID.unwrap_or_else(|| derive_message_id(M::NAME))
}

/// Static description of a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageInfo {
    /// Wire identifier.
    pub id: MessageId,
    /// Rust type identity.
    pub type_id: TypeId,
    /// Declared message name.
    pub name: &'static str,
    /// Rust type name, used in diagnostics.
    pub type_name: &'static str,
}

impl MessageInfo {
    /// Describes `M`.
    pub fn of<M: Message>() -> Self {
        Self {
            id: message_id::<M>(),
            type_id: TypeId::of::<M>(),
            name: M::NAME,
            type_name: std::any::type_name::<M>(),
        }
    }

    /// Whether the message declares a usable name.
    pub fn is_identified(&self) -> bool {
        !self.name.trim().is_empty()
    }
}
