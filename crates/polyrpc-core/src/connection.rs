//! Logical transport endpoint model.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{CoreError, CoreResult};

/// Lifecycle of a [`Connection`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Not yet handshaken; addresses are unavailable.
    Created,
    /// Handshake completed.
    Opened,
    /// Closed by either side or by an error.
    Closed,
}

/// Address of one side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// TCP socket address.
    Tcp(SocketAddr),
    /// Unix domain socket; unnamed client sockets have no path.
    Unix(Option<PathBuf>),
    /// In-process pipe, named for diagnostics.
    Memory(String),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(Some(path)) => write!(f, "unix://{}", path.display()),
            Self::Unix(None) => f.write_str("unix://(unnamed)"),
            Self::Memory(name) => write!(f, "memory://{name}"),
        }
    }
}

/// One logical transport endpoint, owned by its channel.
#[derive(Debug, Clone)]
pub struct Connection {
    state: ConnectionState,
    local: Option<Address>,
    remote: Option<Address>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    /// Creates a connection in the `Created` state.
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Created,
            local: None,
            remote: None,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the connection is usable for I/O.
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Opened
    }

    /// Marks the handshake as completed and records both addresses.
    pub fn open(&mut self, local: Address, remote: Address) -> CoreResult<()> {
        if self.state != ConnectionState::Created {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: ConnectionState::Opened,
            });
        }
        self.local = Some(local);
        self.remote = Some(remote);
        self.state = ConnectionState::Opened;
        Ok(())
    }

    /// Marks the connection closed. Closing twice is harmless.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Local address; unavailable until opened.
    pub fn local_address(&self) -> CoreResult<&Address> {
        self.address(&self.local)
    }

    /// Remote address; unavailable until opened.
    pub fn remote_address(&self) -> CoreResult<&Address> {
        self.address(&self.remote)
    }

    fn address<'a>(&self, slot: &'a Option<Address>) -> CoreResult<&'a Address> {
        match (self.state, slot) {
            (ConnectionState::Created, _) | (_, None) => Err(CoreError::NotOpened),
            (_, Some(addr)) => Ok(addr),
        }
    }
}
