//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use polyrpc_protocol::Endpoint;

/// polyrpc - typed request/response contracts over sockets
#[derive(Debug, Parser)]
#[command(name = "polyrpc")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "POLYRPC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Host the demo echo contract in the foreground
    Serve {
        /// Endpoint to listen on (tcp://host:port or unix:///path)
        #[arg(long, env = "POLYRPC_LISTEN")]
        listen: Option<Endpoint>,

        /// Disconnect clients idle for this many seconds
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Host configuration file
        #[arg(long)]
        host_config: Option<PathBuf>,
    },

    /// Send text to the echo contract
    Echo {
        /// Text to echo
        text: String,

        /// Endpoint of the host
        #[arg(long, env = "POLYRPC_ENDPOINT")]
        endpoint: Option<Endpoint>,
    },

    /// Show the address the host sees for this client
    Whoami {
        /// Endpoint of the host
        #[arg(long, env = "POLYRPC_ENDPOINT")]
        endpoint: Option<Endpoint>,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Show configuration file path
    Path,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_serve() {
        let cli = Cli::try_parse_from([
            "polyrpc",
            "serve",
            "--listen",
            "tcp://127.0.0.1:10678",
            "--idle-timeout",
            "1",
        ])
        .unwrap();
        match cli.command {
            Command::Serve {
                listen,
                idle_timeout,
                host_config,
            } => {
                assert_eq!(listen, Some(Endpoint::tcp("127.0.0.1", 10678)));
                assert_eq!(idle_timeout, Some(1));
                assert!(host_config.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_echo_with_debug() {
        let cli = Cli::try_parse_from(["polyrpc", "-v", "echo", "hello", "--endpoint", "unix:///tmp/p.sock"])
            .unwrap();
        assert!(cli.debug);
        assert!(matches!(
            cli.command,
            Command::Echo { ref text, endpoint: Some(Endpoint::Unix(_)) } if text == "hello"
        ));
    }

    #[test]
    fn rejects_bad_endpoint() {
        assert!(Cli::try_parse_from(["polyrpc", "echo", "x", "--endpoint", "ftp://nope"]).is_err());
    }
}
