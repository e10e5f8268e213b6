//! The demo echo contract served by `polyrpc serve`.

use std::sync::Arc;

use polyrpc_core::{BoxError, Connection, Contract, Formatter, Message, OperationSet};
use serde::{Deserialize, Serialize};

/// Text to echo back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoRequest {
    pub text: String,
}

impl Message for EchoRequest {
    const NAME: &'static str = "demo.EchoRequest";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoReply {
    pub text: String,
}

impl Message for EchoReply {
    const NAME: &'static str = "demo.EchoReply";
}

/// Asks the host how it sees the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhoAmI {}

impl Message for WhoAmI {
    const NAME: &'static str = "demo.WhoAmI";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// The caller's address as seen by the host.
    pub remote: String,
}

impl Message for Identity {
    const NAME: &'static str = "demo.Identity";
}

/// Echo service; one instance per request.
#[derive(Debug, Default)]
pub struct EchoService {
    remote: Option<String>,
}

impl EchoService {
    async fn echo(self: Arc<Self>, request: EchoRequest) -> Result<EchoReply, BoxError> {
        Ok(EchoReply { text: request.text })
    }

    async fn whoami(self: Arc<Self>, _: WhoAmI) -> Result<Identity, BoxError> {
        let remote = self.remote.clone().ok_or("no connection attached")?;
        Ok(Identity { remote })
    }
}

impl Contract for EchoService {
    const NAME: &'static str = "echo";

    fn describe<F: Formatter>(ops: &mut OperationSet<Self, F>) {
        ops.add("echo", Self::echo).add("whoami", Self::whoami);
    }

    fn attach_connection(&mut self, connection: &Connection) {
        self.remote = connection.remote_address().ok().map(ToString::to_string);
    }
}
