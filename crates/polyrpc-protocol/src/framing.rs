//! Length-prefixed envelope framing.
//!
//! Every message travels as a header frame followed by a payload frame:
//!
//! ```text
//! +----------------+--------------+----------------+---------------+
//! | length (4 BE)  | header bytes | length (4 BE)  | payload bytes |
//! +----------------+--------------+----------------+---------------+
//! ```
//!
//! The header carries the 16-bit identifier of the payload's type. There is
//! no magic number and no version byte.

use std::any::Any;

use polyrpc_core::{AnyMessage, Formatter, FormatError, Header, MessageId, MessageMetadata};
use tracing::trace;

use crate::channel::Channel;
use crate::error::{CloseReason, ProtocolError, ProtocolResult};

/// Size of the length prefix in front of every frame.
pub const LENGTH_PREFIX: usize = 4;

/// Initial receive buffer capacity.
pub const DEFAULT_INITIAL_CAPACITY: usize = 4 * 1024;

/// Largest accepted frame (64 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Reusable receive buffer that grows by doubling.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(1)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Grows to at least `needed` bytes, doubling; existing bytes are kept.
    pub fn ensure(&mut self, needed: usize) {
        let mut capacity = self.capacity().max(1);
        while capacity < needed {
            capacity = capacity.saturating_mul(2);
        }
        if capacity != self.buf.len() {
            trace!(from = self.buf.len(), to = capacity, "Growing frame buffer");
            self.buf.resize(capacity, 0);
        }
    }

    pub fn as_slice(&self, len: usize) -> &[u8] {
        &self.buf[..len]
    }

    pub fn as_mut_slice(&mut self, len: usize) -> &mut [u8] {
        &mut self.buf[..len]
    }

    /// Frees the allocation.
    pub fn release(&mut self) {
        self.buf = Vec::new();
    }
}

/// Serializes envelopes onto a [`Channel`] and reads them back.
///
/// One messenger per session: it owns the formatter instance and both buffers.
pub struct Messenger<F> {
    formatter: F,
    receive: FrameBuffer,
    send: Vec<u8>,
    /// Prefix bytes read by [`Messenger::wait_for_envelope`].
    prefix: [u8; LENGTH_PREFIX],
    prefix_len: usize,
    max_message_size: usize,
}

impl<F: Formatter> Default for Messenger<F> {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl<F: Formatter> Messenger<F> {
    pub fn new(initial_capacity: usize, max_message_size: usize) -> Self {
        Self {
            formatter: F::default(),
            receive: FrameBuffer::with_capacity(initial_capacity),
            send: Vec::with_capacity(initial_capacity),
            prefix: [0; LENGTH_PREFIX],
            prefix_len: 0,
            max_message_size,
        }
    }

    /// Current receive buffer capacity.
    pub fn capacity(&self) -> usize {
        self.receive.capacity()
    }

    /// Serializes `message` as a header frame plus a payload frame into the
    /// send buffer.
    pub fn encode(
        &mut self,
        metadata: &MessageMetadata<F>,
        message: &(dyn Any + Send),
    ) -> ProtocolResult<MessageId> {
        let type_id = (message as &dyn Any).type_id();
        let codec = metadata.codec_for(type_id)?;
        let header = Header::new(codec.info.id);

        self.send.clear();
        let max = self.max_message_size;
        let formatter = &mut self.formatter;
        write_frame(&mut self.send, max, |out| formatter.serialize(&header, out))?;
        write_frame(&mut self.send, max, |out| codec.encode(formatter, message, out))?;
        Ok(header.message_id)
    }

    /// Sends `message` in a single write, then flushes.
    ///
    /// Serialization happens before the returned future is first polled, so
    /// the message is not borrowed across the write.
    pub fn send<'a>(
        &'a mut self,
        channel: &'a mut dyn Channel,
        metadata: &MessageMetadata<F>,
        message: &(dyn Any + Send),
    ) -> impl Future<Output = ProtocolResult<()>> + Send + use<'a, F> {
        let encoded = self.encode(metadata, message);
        async move {
            let message_id = encoded?;
            channel.write_all(&self.send).await?;
            channel.flush().await?;
            trace!(message_id, bytes = self.send.len(), "Sent message");
            Ok(())
        }
    }

    /// Receives one envelope and returns the payload with its identifier.
    pub async fn receive(
        &mut self,
        channel: &mut dyn Channel,
        metadata: &MessageMetadata<F>,
    ) -> ProtocolResult<(MessageId, AnyMessage)> {
        let header = self.receive_header(channel).await?;
        let message = self.receive_payload(channel, metadata, header).await?;
        Ok((header.message_id, message))
    }

    /// Waits until the first byte of the next envelope has arrived.
    ///
    /// The bytes read are kept for the following [`receive`](Self::receive)
    /// or [`receive_header`](Self::receive_header). A close before any byte
    /// is orderly.
    pub async fn wait_for_envelope(&mut self, channel: &mut dyn Channel) -> ProtocolResult<()> {
        if self.prefix_len == 0 {
            self.prefix_len = channel.read(&mut self.prefix).await?;
        }
        Ok(())
    }

    /// Waits for the next envelope and reads its header frame.
    pub async fn receive_header(&mut self, channel: &mut dyn Channel) -> ProtocolResult<Header> {
        let len = self.read_frame(channel, true).await?;
        self.formatter
            .deserialize(self.receive.as_slice(len))
            .map_err(|e| decode_error(e, channel))
    }

    /// Reads the payload frame announced by `header`.
    pub async fn receive_payload(
        &mut self,
        channel: &mut dyn Channel,
        metadata: &MessageMetadata<F>,
        header: Header,
    ) -> ProtocolResult<AnyMessage> {
        let codec = metadata.codec(header.message_id)?;
        let len = self.read_frame(channel, false).await?;
        let message = codec
            .decode(&mut self.formatter, self.receive.as_slice(len))
            .map_err(|e| decode_error(e, channel))?;
        trace!(message_id = header.message_id, bytes = len, "Received message");
        Ok(message)
    }

    /// Reads one frame into the receive buffer and returns its length.
    ///
    /// An orderly close is only orderly before the first byte of an envelope.
    async fn read_frame(
        &mut self,
        channel: &mut dyn Channel,
        envelope_start: bool,
    ) -> ProtocolResult<usize> {
        let mut prefix = [0u8; LENGTH_PREFIX];
        let stashed = std::mem::take(&mut self.prefix_len);
        prefix[..stashed].copy_from_slice(&self.prefix[..stashed]);
        read_exact(channel, &mut prefix[stashed..], envelope_start && stashed == 0).await?;

        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: len,
                max: self.max_message_size,
            });
        }

        self.receive.ensure(len);
        read_exact(channel, self.receive.as_mut_slice(len), false).await?;
        Ok(len)
    }

    /// Releases both buffers.
    pub fn dispose(&mut self) {
        self.prefix_len = 0;
        self.receive.release();
        self.send = Vec::new();
    }
}

/// Appends `[len][bytes]`, reserving the prefix and backfilling it.
fn write_frame(
    out: &mut Vec<u8>,
    max: usize,
    serialize: impl FnOnce(&mut Vec<u8>) -> Result<(), FormatError>,
) -> ProtocolResult<()> {
    let start = out.len();
    out.extend_from_slice(&[0; LENGTH_PREFIX]);
    serialize(out)?;

    let len = out.len() - start - LENGTH_PREFIX;
    if len > max {
        return Err(ProtocolError::MessageTooLarge { size: len, max });
    }
    out[start..start + LENGTH_PREFIX].copy_from_slice(&(len as u32).to_be_bytes());
    Ok(())
}

async fn read_exact(
    channel: &mut dyn Channel,
    buf: &mut [u8],
    envelope_start: bool,
) -> ProtocolResult<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match channel.read(&mut buf[filled..]).await {
            Ok(n) => filled += n,
            Err(ProtocolError::ConnectionClosed {
                reason: CloseReason::Orderly,
            }) if !envelope_start || filled > 0 => {
                return Err(ProtocolError::closed(CloseReason::Unexpected));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn decode_error(err: FormatError, channel: &dyn Channel) -> ProtocolError {
    match err {
        FormatError::EndOfData if !channel.connection().is_open() => {
            ProtocolError::closed(CloseReason::Unexpected)
        }
        other => other.into(),
    }
}
