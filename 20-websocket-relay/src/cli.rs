//! Command-line surface: `serve` runs the relay, `client` joins one from a
//! terminal.

use std::{net::IpAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand, builder::TypedValueParser as _};

use crate::{
    hub::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_QUEUE_CAPACITY, HubConfig, MAX_CAPACITY},
    origin::OriginPolicy,
    server::RelayConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve static files and relay WebSocket messages between clients.
    Serve(ServeArgs),
    /// Connect to a relay and exchange lines from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, env = "PORT", default_value_t = 8069)]
    pub port: u16,

    /// Interface address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Directory served for every path other than the WebSocket endpoint.
    #[arg(long, default_value = "public")]
    pub static_dir: PathBuf,

    /// Pending messages a client may fall behind by before it is dropped.
    #[arg(
        long,
        default_value_t = DEFAULT_QUEUE_CAPACITY,
        value_parser = clap::value_parser!(u32)
            .range(1..=MAX_CAPACITY as i64)
            .map(|n| n as usize)
    )]
    pub queue_capacity: usize,

    /// Send each client its own messages as well.
    #[arg(long)]
    pub echo: bool,

    /// Extra origin allowed to open WebSocket connections (repeatable).
    #[arg(long = "allowed-origin", value_name = "ORIGIN")]
    pub allowed_origins: Vec<String>,

    /// Accept WebSocket connections from any origin. Development only.
    #[arg(long, conflicts_with = "allowed_origins")]
    pub allow_any_origin: bool,
}

impl ServeArgs {
    pub fn origin_policy(&self) -> OriginPolicy {
        if self.allow_any_origin {
            OriginPolicy::Any
        } else if self.allowed_origins.is_empty() {
            OriginPolicy::SameHost
        } else {
            OriginPolicy::AllowList(self.allowed_origins.clone())
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            hub: HubConfig {
                queue_capacity: self.queue_capacity,
                channel_capacity: DEFAULT_CHANNEL_CAPACITY,
                echo: self.echo,
            },
            origin_policy: self.origin_policy(),
            static_dir: self.static_dir.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// WebSocket endpoint of the relay.
    #[arg(long, default_value = "ws://localhost:8069/ws")]
    pub url: String,
}
