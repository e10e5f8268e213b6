//! polyrpc host: accepts connections and runs one session per client.
//!
//! A [`Host`] collects contracts and their implementor factories, validates
//! them once at [`Host::start`], binds its [`Listener`] and spawns a session
//! task per accepted connection. Each session serves strictly one request at
//! a time: receive, route, resolve an implementor, dispatch, respond.
//!
//! # Example
//!
//! ```rust,no_run
//! use polyrpc_protocol::Endpoint;
//! use polyrpc_server::{Host, HostConfig, SignalHandler};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HostConfig::new(Endpoint::tcp("127.0.0.1", 10678));
//! let mut host = Host::new(config);
//! // host.add_contract::<MyContract>()?.add_implementor(|| MyContract);
//! host.start().await?;
//!
//! let signals = SignalHandler::for_handle(host.shutdown_handle());
//! signals.spawn_listener()?;
//! signals.shutdown().wait().await;
//! host.stop().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod host;
mod listener;
mod session;
mod signals;

pub use config::{HostConfig, default_socket_path};
pub use error::{ServerError, ServerResult};
pub use host::Host;
pub use listener::{Listener, TcpTransport, for_endpoint};
#[cfg(unix)]
pub use listener::UnixTransport;
pub use session::{ClientInfo, SessionHandle, SessionId, StopReason};
pub use signals::{ShutdownHandle, ShutdownSignal, SignalHandler};
