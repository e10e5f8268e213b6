//! Listening transports.
//!
//! A [`Listener`] is created unbound; [`Listener::prepare_accepting`] binds it
//! and [`Listener::accept_client`] hands out unopened channels.

use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;
use polyrpc_protocol::{Channel, Endpoint, StreamChannel, TransportSettings};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};

/// Source of accepted client channels.
pub trait Listener: Send {
    /// Binds the underlying socket.
    fn prepare_accepting(&mut self) -> BoxFuture<'_, ServerResult<()>>;

    /// Waits for the next client.
    fn accept_client(&mut self) -> BoxFuture<'_, ServerResult<Box<dyn Channel>>>;

    /// The bound endpoint, once bound. Reports the actual port for port 0.
    fn local_endpoint(&self) -> Option<Endpoint>;
}

/// Creates the listener matching `endpoint`.
pub fn for_endpoint(
    endpoint: &Endpoint,
    settings: TransportSettings,
    cleanup_stale_socket: bool,
) -> ServerResult<Box<dyn Listener>> {
    match endpoint {
        Endpoint::Tcp { .. } => Ok(Box::new(TcpTransport::new(endpoint.clone(), settings))),
        #[cfg(unix)]
        Endpoint::Unix(path) => Ok(Box::new(
            UnixTransport::new(path.clone(), settings).with_cleanup_stale_socket(cleanup_stale_socket),
        )),
        #[cfg(not(unix))]
        Endpoint::Unix(path) => {
            let _ = cleanup_stale_socket;
            Err(ServerError::config(format!(
                "unix sockets are not supported on this platform: {}",
                path.display()
            )))
        }
    }
}

/// TCP listener.
pub struct TcpTransport {
    endpoint: Endpoint,
    settings: TransportSettings,
    listener: Option<TcpListener>,
}

impl TcpTransport {
    pub fn new(endpoint: Endpoint, settings: TransportSettings) -> Self {
        Self {
            endpoint,
            settings,
            listener: None,
        }
    }
}

impl Listener for TcpTransport {
    fn prepare_accepting(&mut self) -> BoxFuture<'_, ServerResult<()>> {
        Box::pin(async move {
            let authority = self
                .endpoint
                .authority()
                .ok_or_else(|| ServerError::config(format!("not a tcp endpoint: {}", self.endpoint)))?;
            let listener = TcpListener::bind(&authority).await?;
            info!(address = %listener.local_addr()?, "TCP listener bound");
            self.listener = Some(listener);
            Ok(())
        })
    }

    fn accept_client(&mut self) -> BoxFuture<'_, ServerResult<Box<dyn Channel>>> {
        Box::pin(async move {
            let listener = self.listener.as_ref().ok_or(ServerError::ListenerStopped)?;
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "Accepted TCP client");
            let channel = StreamChannel::tcp(stream, &self.settings)?;
            Ok(Box::new(channel) as Box<dyn Channel>)
        })
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        let addr = self.listener.as_ref()?.local_addr().ok()?;
        Some(Endpoint::tcp(addr.ip().to_string(), addr.port()))
    }
}

/// Unix domain socket listener.
///
/// Removes its socket file when dropped.
#[cfg(unix)]
pub struct UnixTransport {
    path: PathBuf,
    settings: TransportSettings,
    cleanup_stale_socket: bool,
    listener: Option<UnixListener>,
}

#[cfg(unix)]
impl UnixTransport {
    pub fn new(path: impl Into<PathBuf>, settings: TransportSettings) -> Self {
        Self {
            path: path.into(),
            settings,
            cleanup_stale_socket: true,
            listener: None,
        }
    }

    /// Builder: set cleanup stale socket.
    pub fn with_cleanup_stale_socket(mut self, cleanup: bool) -> Self {
        self.cleanup_stale_socket = cleanup;
        self
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    async fn bind(&mut self) -> ServerResult<()> {
        let socket_path = &self.path;

        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            return Err(ServerError::socket_path_invalid(
                parent.to_string_lossy().to_string(),
            ));
        }

        if socket_path.exists() {
            if !self.cleanup_stale_socket {
                return Err(ServerError::socket_in_use(
                    socket_path.to_string_lossy().to_string(),
                ));
            }
            // A live socket answers; a stale one refuses.
            if UnixStream::connect(socket_path).await.is_ok() {
                return Err(ServerError::socket_in_use(
                    socket_path.to_string_lossy().to_string(),
                ));
            }
            info!(path = %socket_path.display(), "Removing stale socket");
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "Unix listener bound");
        self.listener = Some(listener);
        Ok(())
    }
}

#[cfg(unix)]
impl Listener for UnixTransport {
    fn prepare_accepting(&mut self) -> BoxFuture<'_, ServerResult<()>> {
        Box::pin(self.bind())
    }

    fn accept_client(&mut self) -> BoxFuture<'_, ServerResult<Box<dyn Channel>>> {
        Box::pin(async move {
            let listener = self.listener.as_ref().ok_or(ServerError::ListenerStopped)?;
            let (stream, _addr) = listener.accept().await?;
            debug!("Accepted Unix client");
            let channel = StreamChannel::unix(stream, &self.settings)?;
            Ok(Box::new(channel) as Box<dyn Channel>)
        })
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        self.listener.as_ref()?;
        Some(Endpoint::Unix(self.path.clone()))
    }
}

#[cfg(unix)]
impl Drop for UnixTransport {
    fn drop(&mut self) {
        if self.listener.take().is_none() || !self.path.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove socket file"
            );
        } else {
            debug!(path = %self.path.display(), "Removed socket file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn tcp_reports_bound_port() {
        let mut listener = TcpTransport::new(Endpoint::tcp("127.0.0.1", 0), TransportSettings::default());
        assert!(listener.local_endpoint().is_none());
        listener.prepare_accepting().await.unwrap();

        let Some(Endpoint::Tcp { host, port }) = listener.local_endpoint() else {
            panic!("expected a tcp endpoint");
        };
        assert_eq!(host, "127.0.0.1");
        assert_ne!(port, 0);

        let connect = tokio::spawn(async move { tokio::net::TcpStream::connect(("127.0.0.1", port)).await });
        let channel = listener.accept_client().await.unwrap();
        assert!(!channel.connection().is_open());
        connect.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn accept_before_bind_is_listener_stopped() {
        let mut listener = TcpTransport::new(Endpoint::tcp("127.0.0.1", 0), TransportSettings::default());
        assert!(matches!(
            listener.accept_client().await,
            Err(ServerError::ListenerStopped)
        ));
    }

    #[tokio::test]
    async fn unix_creates_and_removes_socket_file() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut listener = UnixTransport::new(&socket_path, TransportSettings::default());
        listener.prepare_accepting().await.unwrap();
        assert!(socket_path.exists());
        assert_eq!(listener.local_endpoint(), Some(Endpoint::unix(&socket_path)));

        drop(listener);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn unix_rejects_live_socket() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut first = UnixTransport::new(&socket_path, TransportSettings::default());
        first.prepare_accepting().await.unwrap();

        let mut second = UnixTransport::new(&socket_path, TransportSettings::default());
        assert!(matches!(
            second.prepare_accepting().await,
            Err(ServerError::SocketInUse { .. })
        ));

        let mut strict = UnixTransport::new(&socket_path, TransportSettings::default())
            .with_cleanup_stale_socket(false);
        assert!(matches!(
            strict.prepare_accepting().await,
            Err(ServerError::SocketInUse { .. })
        ));
    }

    #[tokio::test]
    async fn unix_cleans_stale_socket() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let mut listener = UnixTransport::new(&socket_path, TransportSettings::default());
        listener.prepare_accepting().await.unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn unix_rejects_missing_parent() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("missing").join("test.sock");
        let mut listener = UnixTransport::new(&socket_path, TransportSettings::default());
        assert!(matches!(
            listener.prepare_accepting().await,
            Err(ServerError::SocketPathInvalid { .. })
        ));
    }
}
