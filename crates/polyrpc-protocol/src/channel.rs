//! Byte channels carrying framed messages.
//!
//! A [`Channel`] owns its [`Connection`] and moves raw bytes; framing lives in
//! [`Messenger`](crate::Messenger). [`StreamChannel`] adapts any tokio stream:
//! TCP and Unix sockets in production, `tokio::io::duplex` pipes in tests.

use futures_util::future::BoxFuture;
use polyrpc_core::{Address, Connection, ConnectionState, CoreError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream, DuplexStream};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::{debug, trace};

use crate::error::{CloseReason, ProtocolError, ProtocolResult};
use crate::settings::TransportSettings;

/// Bidirectional byte pipe with an observable connection.
///
/// Reading zero bytes raises [`ProtocolError::ConnectionClosed`] with reason
/// [`CloseReason::Orderly`] instead of returning `Ok(0)`.
pub trait Channel: Send {
    fn connection(&self) -> &Connection;

    /// Completes the handshake and records both addresses.
    fn open(&mut self) -> BoxFuture<'_, ProtocolResult<()>>;

    /// Reads at least one byte into `buf`.
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, ProtocolResult<usize>>;

    fn write_all<'a>(&'a mut self, buf: &'a [u8]) -> BoxFuture<'a, ProtocolResult<()>>;

    fn flush(&mut self) -> BoxFuture<'_, ProtocolResult<()>>;

    /// Shuts the stream down. Closing twice is harmless.
    fn close(&mut self) -> BoxFuture<'_, ProtocolResult<()>>;
}

/// [`Channel`] over a buffered tokio stream.
pub struct StreamChannel<S> {
    stream: Option<BufStream<S>>,
    connection: Connection,
    addresses: Option<(Address, Address)>,
}

impl<S> std::fmt::Debug for StreamChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChannel")
            .field("connection", &self.connection)
            .finish()
    }
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps a connected stream with default buffer sizes.
    pub fn new(stream: S, local: Address, remote: Address) -> Self {
        Self::with_settings(stream, local, remote, &TransportSettings::default())
    }

    /// Wraps a connected stream, sizing its buffers from `settings`.
    pub fn with_settings(
        stream: S,
        local: Address,
        remote: Address,
        settings: &TransportSettings,
    ) -> Self {
        let stream = BufStream::with_capacity(
            settings.receive_buffer_size.max(1),
            settings.send_buffer_size.max(1),
            stream,
        );
        Self {
            stream: Some(stream),
            connection: Connection::new(),
            addresses: Some((local, remote)),
        }
    }

    fn stream(&mut self) -> ProtocolResult<&mut BufStream<S>> {
        match self.connection.state() {
            ConnectionState::Created => Err(CoreError::NotOpened.into()),
            ConnectionState::Closed => Err(ProtocolError::closed(CloseReason::Disposed)),
            ConnectionState::Opened => self
                .stream
                .as_mut()
                .ok_or(ProtocolError::closed(CloseReason::Disposed)),
        }
    }

    fn fail(&mut self, err: ProtocolError) -> ProtocolError {
        if err.is_connection_closed() {
            self.connection.close();
        }
        err
    }
}

impl StreamChannel<TcpStream> {
    /// Wraps a connected TCP stream.
    pub fn tcp(stream: TcpStream, settings: &TransportSettings) -> ProtocolResult<Self> {
        stream.set_nodelay(settings.no_delay)?;
        let local = Address::Tcp(stream.local_addr()?);
        let remote = Address::Tcp(stream.peer_addr()?);
        Ok(Self::with_settings(stream, local, remote, settings))
    }
}

#[cfg(unix)]
impl StreamChannel<UnixStream> {
    /// Wraps a connected Unix stream.
    pub fn unix(stream: UnixStream, settings: &TransportSettings) -> ProtocolResult<Self> {
        let local = Address::Unix(stream.local_addr()?.as_pathname().map(Into::into));
        let remote = Address::Unix(stream.peer_addr()?.as_pathname().map(Into::into));
        Ok(Self::with_settings(stream, local, remote, settings))
    }
}

impl StreamChannel<DuplexStream> {
    /// In-process connected pair; the first element is the server side.
    pub fn memory_pair(name: &str, capacity: usize) -> (Self, Self) {
        let (server, client) = tokio::io::duplex(capacity);
        let server_addr = Address::Memory(format!("{name}/server"));
        let client_addr = Address::Memory(format!("{name}/client"));
        (
            Self::new(server, server_addr.clone(), client_addr.clone()),
            Self::new(client, client_addr, server_addr),
        )
    }
}

impl<S> Channel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn open(&mut self) -> BoxFuture<'_, ProtocolResult<()>> {
        Box::pin(async move {
            let (local, remote) = self
                .addresses
                .take()
                .ok_or(ProtocolError::closed(CloseReason::Disposed))?;
            trace!(%local, %remote, "Opening channel");
            self.connection.open(local, remote)?;
            Ok(())
        })
    }

    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, ProtocolResult<usize>> {
        Box::pin(async move {
            if buf.is_empty() {
                return Ok(0);
            }
            let result = self.stream()?.read(buf).await;
            match result {
                Ok(0) => Err(self.fail(ProtocolError::closed(CloseReason::Orderly))),
                Ok(n) => Ok(n),
                Err(e) => Err(self.fail(e.into())),
            }
        })
    }

    fn write_all<'a>(&'a mut self, buf: &'a [u8]) -> BoxFuture<'a, ProtocolResult<()>> {
        Box::pin(async move {
            let result = self.stream()?.write_all(buf).await;
            result.map_err(|e| self.fail(e.into()))
        })
    }

    fn flush(&mut self) -> BoxFuture<'_, ProtocolResult<()>> {
        Box::pin(async move {
            let result = self.stream()?.flush().await;
            result.map_err(|e| self.fail(e.into()))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ProtocolResult<()>> {
        Box::pin(async move {
            self.connection.close();
            self.addresses = None;
            if let Some(mut stream) = self.stream.take() {
                // The peer may already be gone.
                if let Err(e) = stream.shutdown().await {
                    debug!(error = %e, "Stream shutdown failed");
                }
            }
            Ok(())
        })
    }
}
