//! polyrpc CLI entry point.

use std::process::ExitCode;

use clap::Parser;
use polyrpc_core::{TracingConfig, init_tracing};

use polyrpc_client::cli::{Cli, Command, ConfigAction};
use polyrpc_client::commands;
use polyrpc_client::config::ClientConfig;
use polyrpc_client::error::ClientResult;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let tracing_config = if cli.debug {
        TracingConfig::cli_debug()
    } else {
        TracingConfig::default()
    };
    if let Err(e) = init_tracing(tracing_config) {
        eprintln!("warning: {}", e);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ClientResult<()> {
    let config = match cli.config {
        Some(ref path) => ClientConfig::load_from(path)?,
        None => ClientConfig::load()?,
    };

    match cli.command {
        Command::Serve {
            listen,
            idle_timeout,
            host_config,
        } => commands::serve::run(listen, idle_timeout, host_config.as_deref()).await,
        Command::Echo { text, endpoint } => commands::call::echo(&config, endpoint, text).await,
        Command::Whoami { endpoint } => commands::call::whoami(&config, endpoint).await,
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config),
            ConfigAction::Path => commands::config::path(),
        },
    }
}
