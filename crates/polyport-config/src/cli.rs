//! Command-line argument parsing for polyport binaries.

use std::path::PathBuf;

use clap::Args;

use crate::Config;
use crate::protocol::{ClientProtocol, ProtocolSet};

/// Common polyport command-line arguments.
///
/// CLI values override settings loaded from `config.ron`. Binaries flatten
/// this into their own parser.
#[derive(Args, Debug, Default)]
pub struct CliArgs {
    /// Server address a client connects to.
    #[arg(long)]
    pub server: Option<String>,

    /// Base server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Client protocol (none, udp, ws, relay-udp, relay-ws, auto).
    #[arg(long)]
    pub client_protocol: Option<ClientProtocol>,

    /// Comma separated server protocols, or `all`.
    #[arg(long)]
    pub server_protocols: Option<ProtocolSet>,

    /// Maximum connected peers.
    #[arg(long)]
    pub max_peers: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.server {
            self.network.server_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.base_port = port;
        }
        if let Some(protocol) = args.client_protocol {
            self.network.client_protocol = protocol;
        }
        if let Some(protocols) = args.server_protocols {
            self.network.server_protocols = protocols;
        }
        if let Some(max) = args.max_peers {
            self.network.max_peers = max;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
