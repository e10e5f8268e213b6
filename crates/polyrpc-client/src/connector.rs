//! Opens channels to a host.

use std::time::Duration;

use polyrpc_protocol::{
    Channel, Endpoint, ProtocolError, ProtocolResult, StreamChannel, TransportSettings,
};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

/// Connects to `endpoint` and returns an opened channel.
pub async fn connect(
    endpoint: &Endpoint,
    settings: &TransportSettings,
    timeout: Option<Duration>,
) -> ProtocolResult<Box<dyn Channel>> {
    debug!(%endpoint, "Connecting");
    let mut channel = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, open_stream(endpoint, settings))
            .await
            .map_err(|_| ProtocolError::Timeout {
                operation: "connect",
            })??,
        None => open_stream(endpoint, settings).await?,
    };
    channel.open().await?;
    debug!(%endpoint, "Connected");
    Ok(channel)
}

async fn open_stream(
    endpoint: &Endpoint,
    settings: &TransportSettings,
) -> ProtocolResult<Box<dyn Channel>> {
    let open_error = |source: std::io::Error| ProtocolError::ConnectionOpen {
        endpoint: endpoint.to_string(),
        source,
    };
    match endpoint {
        Endpoint::Tcp { .. } => {
            let authority = endpoint
                .authority()
                .ok_or_else(|| ProtocolError::invalid_endpoint(endpoint.to_string(), "missing host"))?;
            let stream = TcpStream::connect(authority).await.map_err(open_error)?;
            Ok(Box::new(StreamChannel::tcp(stream, settings)?))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path).await.map_err(open_error)?;
            Ok(Box::new(StreamChannel::unix(stream, settings)?))
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(ProtocolError::invalid_endpoint(
            endpoint.to_string(),
            "unix sockets are not supported on this platform",
        )),
    }
}
