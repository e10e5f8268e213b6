//! `polyrpc serve`: hosts the demo echo contract in the foreground.

use std::path::Path;
use std::time::Duration;

use polyrpc_protocol::Endpoint;
use polyrpc_server::{Host, HostConfig, SignalHandler};
use tracing::info;

use crate::demo::EchoService;
use crate::error::ClientResult;

/// Serves until SIGTERM/SIGINT.
pub async fn run(
    listen: Option<Endpoint>,
    idle_timeout_secs: Option<u64>,
    host_config: Option<&Path>,
) -> ClientResult<()> {
    let config = host_config_for(listen, idle_timeout_secs, host_config)?;
    let mut host = Host::new(config);
    host.add_contract::<EchoService>()?
        .add_implementor(EchoService::default);
    host.start().await?;

    let signals = SignalHandler::for_handle(host.shutdown_handle());
    signals.spawn_listener()?;
    if let Some(endpoint) = host.local_endpoint() {
        info!(%endpoint, "Serving echo contract");
    }

    signals.shutdown().wait().await;
    info!("Shutting down");
    host.stop().await;
    Ok(())
}

/// Command-line flags override the file.
fn host_config_for(
    listen: Option<Endpoint>,
    idle_timeout_secs: Option<u64>,
    host_config: Option<&Path>,
) -> ClientResult<HostConfig> {
    let mut config = match host_config {
        Some(path) => HostConfig::load_from(path)?,
        None => HostConfig::default(),
    };
    if let Some(endpoint) = listen {
        config.endpoint = endpoint;
    }
    if let Some(secs) = idle_timeout_secs {
        config = config.with_idle_timeout(Duration::from_secs(secs));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");
        std::fs::write(&path, "endpoint = \"tcp://127.0.0.1:1\"\nmax_connections = 3\n").unwrap();

        let config = host_config_for(
            Some(Endpoint::tcp("127.0.0.1", 10678)),
            Some(2),
            Some(&path),
        )
        .unwrap();
        assert_eq!(config.endpoint, Endpoint::tcp("127.0.0.1", 10678));
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.transport.idle_timeout, Some(Duration::from_secs(2)));
    }
}
