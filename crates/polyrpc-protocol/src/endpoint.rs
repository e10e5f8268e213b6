//! Endpoint URLs: `tcp://host:port` and `unix:///path/to.sock`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ProtocolError, ProtocolResult};

/// Where a host listens or a client connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }

    /// Socket path of a Unix endpoint.
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Self::Unix(path) => Some(path),
            Self::Tcp { .. } => None,
        }
    }

    /// `host:port` of a TCP endpoint, suitable for `TcpListener::bind`.
    pub fn authority(&self) -> Option<String> {
        match self {
            Self::Tcp { host, port } => Some(format!("{host}:{port}")),
            Self::Unix(_) => None,
        }
    }
}

impl FromStr for Endpoint {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        let url = Url::parse(s).map_err(|e| ProtocolError::invalid_endpoint(s, e.to_string()))?;
        match url.scheme() {
            "tcp" => {
                let host = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| ProtocolError::invalid_endpoint(s, "missing host"))?;
                let port = url
                    .port()
                    .ok_or_else(|| ProtocolError::invalid_endpoint(s, "missing port"))?;
                // IPv6 hosts come back bracketed.
                let host = host.trim_start_matches('[').trim_end_matches(']');
                Ok(Self::tcp(host, port))
            }
            "unix" => {
                if url.host_str().is_some_and(|h| !h.is_empty()) {
                    return Err(ProtocolError::invalid_endpoint(
                        s,
                        "socket path must be absolute (unix:///path)",
                    ));
                }
                let path = url.path();
                if path.is_empty() || path == "/" {
                    return Err(ProtocolError::invalid_endpoint(s, "missing socket path"));
                }
                Ok(Self::unix(path))
            }
            other => Err(ProtocolError::invalid_endpoint(
                s,
                format!("unsupported scheme `{other}`"),
            )),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ProtocolError;

    fn try_from(value: String) -> ProtocolResult<Self> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp() {
        let endpoint: Endpoint = "tcp://127.0.0.1:10678".parse().unwrap();
        assert_eq!(endpoint, Endpoint::tcp("127.0.0.1", 10678));
        assert_eq!(endpoint.authority().as_deref(), Some("127.0.0.1:10678"));
        assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:10678");

        let v6: Endpoint = "tcp://[::1]:9000".parse().unwrap();
        assert_eq!(v6, Endpoint::tcp("::1", 9000));
        assert_eq!(v6.to_string(), "tcp://[::1]:9000");
    }

    #[test]
    fn parses_unix() {
        let endpoint: Endpoint = "unix:///run/polyrpc.sock".parse().unwrap();
        assert_eq!(endpoint.socket_path(), Some(Path::new("/run/polyrpc.sock")));
        assert_eq!(endpoint.to_string(), "unix:///run/polyrpc.sock");
    }

    #[test]
    fn rejects_bad_endpoints() {
        for input in [
            "tcp://127.0.0.1",
            "unix://relative/path.sock",
            "unix:///",
            "http://localhost:80",
            "not a url",
        ] {
            let err = input.parse::<Endpoint>().unwrap_err();
            assert!(
                matches!(err, ProtocolError::InvalidEndpoint { .. }),
                "{input}: {err}"
            );
        }
    }

    #[test]
    fn serde_as_string() {
        let endpoint = Endpoint::tcp("localhost", 1);
        let json = serde_json::to_string(&endpoint).unwrap();
        assert_eq!(json, "\"tcp://localhost:1\"");
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, endpoint);
    }
}
