//! Client, proxies, the demo echo contract and the `polyrpc` CLI.
//!
//! A [`Client`] registers the same contracts as the host it talks to and
//! calls them through a typed [`Proxy`].

pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod connector;
pub mod demo;
pub mod error;

pub use cli::Cli;
pub use client::{Client, Proxy};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
