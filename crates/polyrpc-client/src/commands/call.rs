//! `polyrpc echo` and `polyrpc whoami`: one call against a running host.

use std::time::Instant;

use polyrpc_protocol::Endpoint;
use tracing::debug;

use crate::client::Client;
use crate::config::ClientConfig;
use crate::demo::{EchoReply, EchoRequest, EchoService, Identity, WhoAmI};
use crate::error::ClientResult;

async fn connect(config: &ClientConfig, endpoint: Option<Endpoint>) -> ClientResult<Client> {
    let mut config = config.clone();
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }
    let mut client = Client::new(config);
    client.add_contract::<EchoService>()?;
    client.connect().await?;
    Ok(client)
}

/// Sends `text` and prints the echo.
pub async fn echo(config: &ClientConfig, endpoint: Option<Endpoint>, text: String) -> ClientResult<()> {
    let mut client = connect(config, endpoint).await?;
    let started = Instant::now();
    let reply: EchoReply = client
        .get::<EchoService>()?
        .call(EchoRequest { text })
        .await?;
    debug!(elapsed_us = started.elapsed().as_micros() as u64, "Echo completed");
    println!("{}", reply.text);
    client.close().await;
    Ok(())
}

/// Prints the address the host sees for this client.
pub async fn whoami(config: &ClientConfig, endpoint: Option<Endpoint>) -> ClientResult<()> {
    let mut client = connect(config, endpoint).await?;
    let identity: Identity = client.get::<EchoService>()?.call(WhoAmI {}).await?;
    println!("{}", identity.remote);
    client.close().await;
    Ok(())
}
