//! Echo demo for the polyport transport.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run `cargo run -p polyport-demo -- --role server` in one terminal and
//! `cargo run -p polyport-demo -- --role client` in another. The server echoes
//! every payload back; the client sends one numbered message per tick.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use polyport_config::{CliArgs, Config, default_config_dir};
use polyport_transport::{
    Connection, ConnectionHandle, DefaultDriverFactory, DisconnectReason, NetworkPeer, Payload,
    Role, RunOptions, Transport, TransportSettings,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "polyport-demo", about = "Echo server and client over polyport")]
struct DemoArgs {
    #[command(flatten)]
    common: CliArgs,

    /// Which side to run.
    #[arg(long, value_enum, default_value_t = DemoRole::Server)]
    role: DemoRole,

    /// Stop after this many ticks (runs forever when omitted).
    #[arg(long)]
    ticks: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DemoRole {
    Server,
    Client,
}

impl From<DemoRole> for Role {
    fn from(role: DemoRole) -> Self {
        match role {
            DemoRole::Server => Role::Server,
            DemoRole::Client => Role::Client,
        }
    }
}

// ---- Peers ----

/// Queues every received payload so it can be echoed after the tick.
#[derive(Default)]
struct EchoPeer {
    outgoing: Vec<(ConnectionHandle, Vec<u8>)>,
}

impl NetworkPeer for EchoPeer {
    fn on_connect_request(&mut self, request: &[u8], remote: Option<SocketAddr>) -> bool {
        info!(
            remote = ?remote,
            greeting = %String::from_utf8_lossy(request),
            "Connect request"
        );
        true
    }

    fn on_connected(&mut self, connection: &Connection) {
        info!(
            handle = %connection.handle(),
            protocol = %connection.protocol(),
            remote = ?connection.remote_addr(),
            "Client joined"
        );
    }

    fn on_disconnected(&mut self, connection: &Connection, reason: DisconnectReason) {
        info!(handle = %connection.handle(), ?reason, "Client left");
    }

    fn receive(&mut self, connection: &Connection, payload: Payload<'_>) {
        self.outgoing
            .push((connection.handle(), payload.bytes().to_vec()));
    }
}

#[derive(Default)]
struct ClientPeer {
    server: Option<ConnectionHandle>,
    failed: bool,
    echoes: u64,
}

impl NetworkPeer for ClientPeer {
    fn on_connected(&mut self, connection: &Connection) {
        info!(
            protocol = %connection.protocol(),
            max_payload = connection.max_payload_size(),
            "Connected to server"
        );
        self.server = Some(connection.handle());
    }

    fn on_disconnected(&mut self, _connection: &Connection, reason: DisconnectReason) {
        warn!(?reason, "Disconnected from server");
        self.server = None;
        self.failed = true;
    }

    fn on_connect_failed(&mut self, reason: DisconnectReason) {
        warn!(?reason, "Could not connect");
        self.failed = true;
    }

    fn receive(&mut self, _connection: &Connection, payload: Payload<'_>) {
        self.echoes += 1;
        info!(echo = %String::from_utf8_lossy(payload.bytes()), "Echo received");
    }
}

// ---- Main loop ----

fn main() -> ExitCode {
    let args = DemoArgs::parse();

    let config_dir = match args
        .common
        .config
        .clone()
        .map(Ok)
        .unwrap_or_else(default_config_dir)
    {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to resolve config directory: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args.common);

    let log_dir = config_dir.join("logs");
    polyport_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let mut transport = Transport::new(
        TransportSettings::from(&config),
        DefaultDriverFactory::default(),
    );
    if let Err(e) = transport.run(args.role.into(), RunOptions::default()) {
        tracing::error!(error = %e, "Failed to start transport");
        return ExitCode::FAILURE;
    }

    let tick = Duration::from_secs(1) / config.network.tick_rate.max(1);
    let result = match args.role {
        DemoRole::Server => run_server(&mut transport, tick, args.ticks),
        DemoRole::Client => run_client(&mut transport, &config, tick, args.ticks),
    };
    transport.shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Demo failed");
            ExitCode::FAILURE
        }
    }
}

fn run_server(
    transport: &mut Transport,
    tick: Duration,
    ticks: Option<u64>,
) -> Result<(), polyport_transport::TransportError> {
    for (protocol, addr) in transport.bound_endpoints() {
        info!(%protocol, %addr, "Listening");
    }

    let mut peer = EchoPeer::default();
    let mut count = 0u64;
    while ticks.is_none_or(|limit| count < limit) {
        let started = Instant::now();
        transport.poll_events(&mut peer);
        for (handle, bytes) in peer.outgoing.drain(..) {
            transport.send(handle, &bytes);
        }
        count += 1;
        sleep_rest(started, tick);
    }

    let stats = transport.pool_stats();
    info!(ticks = count, active = stats.active, "Server stopping");
    Ok(())
}

fn run_client(
    transport: &mut Transport,
    config: &Config,
    tick: Duration,
    ticks: Option<u64>,
) -> Result<(), polyport_transport::TransportError> {
    transport.connect(
        &config.network.server_address,
        config.network.base_port,
        Some(b"hello from polyport-demo".as_slice()),
    )?;

    let mut peer = ClientPeer::default();
    let mut count = 0u64;
    let mut sent = 0u64;
    while ticks.is_none_or(|limit| count < limit) && !peer.failed {
        let started = Instant::now();
        transport.poll_events(&mut peer);
        if let Some(handle) = peer.server {
            sent += 1;
            transport.send(handle, format!("message {sent}").as_bytes());
        }
        count += 1;
        sleep_rest(started, tick);
    }

    info!(sent, echoes = peer.echoes, "Client stopping");
    Ok(())
}

fn sleep_rest(started: Instant, tick: Duration) {
    if let Some(rest) = tick.checked_sub(started.elapsed()) {
        std::thread::sleep(rest);
    }
}
