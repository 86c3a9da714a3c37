//! The transport: run lifecycle and per-tick event demultiplexing.
//!
//! A run goes through a fixed sequence: plan the backend set, configure
//! security, validate relay credentials, create every driver, then bind. Any
//! failure before binding leaves no socket open. Once running, the owner
//! calls [`Transport::poll_events`] once per tick; all [`NetworkPeer`]
//! callbacks happen inside that call.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};

use polyport_config::{
    BindFailurePolicy, Config, NetworkConfig, Protocol, SecurityConfig, TuningConfig,
};

use crate::aggregator::{ConnectionKey, MultiDriver};
use crate::driver::{
    BackendSettings, DisconnectReason, Driver, DriverEvent, DriverFactory,
    MAX_CONNECT_REQUEST_SIZE,
};
use crate::error::TransportError;
use crate::peer::NetworkPeer;
use crate::pool::{Connection, ConnectionHandle, ConnectionPool, PoolStats};
use crate::relay::RelayCredentials;
use crate::scratch::ScratchBuffer;
use crate::secure::configure_security;
use crate::selector::{BackendPlan, CapabilityTable, Role, plan};

/// Configuration a transport runs with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportSettings {
    /// Protocol selection, addressing and peer limits.
    pub network: NetworkConfig,
    /// Raw tuning handed to every driver.
    pub tuning: TuningConfig,
    /// Encryption switch and credentials.
    pub security: SecurityConfig,
}

impl From<&Config> for TransportSettings {
    fn from(config: &Config) -> Self {
        Self {
            network: config.network.clone(),
            tuning: config.tuning.clone(),
            security: config.security.clone(),
        }
    }
}

/// Per-run inputs that do not belong in the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Relay allocation, required when a relay protocol is planned.
    pub relay: Option<RelayCredentials>,
}

/// State that exists only while running.
struct ActiveRun {
    role: Role,
    drivers: MultiDriver,
    pool: ConnectionPool,
    scratch: ScratchBuffer,
    /// Client only: protocol used to reach the server.
    client_protocol: Option<Protocol>,
    /// Client only: backend connection to the server, from `connect` until it ends.
    server_key: Option<ConnectionKey>,
    handles: Vec<ConnectionHandle>,
}

/// Connection-oriented transport multiplexing several backends.
pub struct Transport {
    settings: TransportSettings,
    factory: Box<dyn DriverFactory>,
    capabilities: CapabilityTable,
    run: Option<ActiveRun>,
}

impl Transport {
    /// Create an idle transport that builds its backends with `factory`.
    pub fn new(settings: TransportSettings, factory: impl DriverFactory + 'static) -> Self {
        Self {
            settings,
            factory: Box::new(factory),
            capabilities: CapabilityTable::current(),
            run: None,
        }
    }

    /// Use a different platform capability table.
    pub fn with_capabilities(mut self, capabilities: CapabilityTable) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Start a run in the given role.
    pub fn run(&mut self, role: Role, options: RunOptions) -> Result<(), TransportError> {
        if self.run.is_some() {
            return Err(TransportError::AlreadyRunning);
        }

        let plans = plan(role, &self.settings.network, &self.capabilities)?;
        let security = configure_security(&self.settings.security, role)?;
        let relay = options.relay.as_ref();
        for backend in &plans {
            if backend.protocol.is_relay() {
                relay
                    .ok_or(TransportError::MissingRelayCredentials(backend.protocol))?
                    .validate()?;
            }
        }

        let mut created = Vec::with_capacity(plans.len());
        for backend in &plans {
            let settings = BackendSettings {
                protocol: backend.protocol,
                interface: self.capabilities.interface(backend.protocol),
                role,
                tuning: &self.settings.tuning,
                security: &security,
                relay: relay.filter(|_| backend.protocol.is_relay()),
            };
            created.push((*backend, self.factory.create(&settings)?));
        }

        let mut drivers = MultiDriver::new();
        match role {
            Role::Server => {
                self.bind_all(created, &mut drivers)?;
                if drivers.is_empty() {
                    return Err(TransportError::NoBackendsBound);
                }
            }
            Role::Client => {
                for (_, driver) in created {
                    drivers.add_driver(driver);
                }
            }
        }

        let capacity = match role {
            Role::Server => self.settings.network.max_peers as usize,
            Role::Client => 1,
        };
        let client_protocol = match role {
            Role::Server => None,
            Role::Client => plans.first().map(|backend| backend.protocol),
        };
        let scratch = ScratchBuffer::new(drivers.max_payload_capacity());

        tracing::info!(
            role = role.name(),
            backends = ?plans.iter().map(|p| p.protocol).collect::<Vec<_>>(),
            endpoints = ?drivers.bound_endpoints(),
            capacity,
            encrypted = security.is_encrypted(),
            "Transport running"
        );

        self.run = Some(ActiveRun {
            role,
            drivers,
            pool: ConnectionPool::new(capacity),
            scratch,
            client_protocol,
            server_key: None,
            handles: Vec::with_capacity(capacity),
        });
        Ok(())
    }

    fn bind_all(
        &self,
        created: Vec<(BackendPlan, Box<dyn Driver>)>,
        drivers: &mut MultiDriver,
    ) -> Result<(), TransportError> {
        let policy = self.settings.network.bind_failure;
        for (backend, driver) in created {
            let port = backend.port.unwrap_or(0);
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            match drivers.bind_and_listen(driver, addr) {
                Ok((index, bound)) => {
                    tracing::debug!(
                        protocol = %backend.protocol,
                        driver = index.0,
                        %bound,
                        "Backend ready"
                    );
                }
                Err(source) => {
                    match policy {
                        BindFailurePolicy::Skip => {
                            tracing::warn!(
                                protocol = %backend.protocol,
                                port,
                                error = %source,
                                "Backend failed to bind, continuing without it"
                            );
                        }
                        BindFailurePolicy::Abort => {
                            tracing::error!(
                                protocol = %backend.protocol,
                                port,
                                error = %source,
                                "Backend failed to bind"
                            );
                            drivers.dispose();
                            return Err(TransportError::BindFailed {
                                protocol: backend.protocol,
                                port,
                                source,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Start connecting to a server. Client runs only.
    ///
    /// The outcome arrives through [`NetworkPeer::on_connected`] or
    /// [`NetworkPeer::on_connect_failed`].
    pub fn connect(
        &mut self,
        address: &str,
        port: u16,
        request: Option<&[u8]>,
    ) -> Result<(), TransportError> {
        let run = self.run.as_mut().ok_or(TransportError::NotRunning)?;
        if run.role != Role::Client {
            return Err(TransportError::WrongRole(run.role.name()));
        }
        if let Some(request) = request
            && request.len() > MAX_CONNECT_REQUEST_SIZE
        {
            return Err(TransportError::RequestTooLarge {
                size: request.len(),
                max: MAX_CONNECT_REQUEST_SIZE,
            });
        }
        if let Some(key) = run.server_key
            && run.drivers.is_alive(key)
        {
            return Err(TransportError::AlreadyConnected);
        }

        let endpoint = (address, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| TransportError::InvalidAddress(format!("{address}:{port}")))?;
        let protocol = run.client_protocol.ok_or(TransportError::NoClientProtocol)?;

        let key = run.drivers.connect(protocol, endpoint, request)?;
        run.server_key = Some(key);
        tracing::info!(%protocol, %endpoint, "Connecting to server");
        Ok(())
    }

    /// Send a payload. Stale handles and dead connections are ignored.
    pub fn send(&mut self, handle: ConnectionHandle, payload: &[u8]) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let Some(connection) = run.pool.get(handle) else {
            tracing::trace!(%handle, "Send on stale handle ignored");
            return;
        };
        let key = connection.key();
        run.drivers.send(key, payload);
    }

    /// Close a connection now. `peer` is told with
    /// [`DisconnectReason::ClosedLocally`]. Returns `false` if the handle was
    /// already stale.
    pub fn disconnect<P: NetworkPeer + ?Sized>(
        &mut self,
        handle: ConnectionHandle,
        peer: &mut P,
    ) -> bool {
        let Some(run) = self.run.as_mut() else {
            return false;
        };
        let Some(connection) = run.pool.get(handle).cloned() else {
            return false;
        };

        run.drivers.disconnect(connection.key());
        peer.on_disconnected(&connection, DisconnectReason::ClosedLocally);
        run.pool.release(handle);
        if run.server_key == Some(connection.key()) {
            run.server_key = None;
        }
        tracing::debug!(%handle, "Connection closed locally");
        true
    }

    /// Pump every backend once and deliver the resulting callbacks.
    pub fn poll_events<P: NetworkPeer + ?Sized>(&mut self, peer: &mut P) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        run.drivers.update();
        match run.role {
            Role::Server => run.poll_server(peer),
            Role::Client => run.poll_client(peer),
        }
    }

    /// End the run and release every backend. No callbacks are delivered.
    pub fn shutdown(&mut self) {
        if let Some(mut run) = self.run.take() {
            let active = run.pool.active_len();
            run.drivers.dispose();
            tracing::info!(role = run.role.name(), active, "Transport shut down");
        }
    }

    /// Role of the active run.
    pub fn role(&self) -> Option<Role> {
        self.run.as_ref().map(|run| run.role)
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Resolve a connection handle.
    pub fn connection(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.run.as_ref()?.pool.get(handle)
    }

    /// All established connections.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.run.iter().flat_map(|run| run.pool.active())
    }

    /// Pool occupancy. All zero when idle.
    pub fn pool_stats(&self) -> PoolStats {
        self.run
            .as_ref()
            .map(|run| run.pool.stats())
            .unwrap_or_default()
    }

    /// Protocol and local endpoint of every bound backend.
    pub fn bound_endpoints(&self) -> Vec<(Protocol, SocketAddr)> {
        self.run
            .as_ref()
            .map(|run| run.drivers.bound_endpoints())
            .unwrap_or_default()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---- Tick handling ----

impl ActiveRun {
    fn poll_server<P: NetworkPeer + ?Sized>(&mut self, peer: &mut P) {
        let mut handles = std::mem::take(&mut self.handles);

        // Connections whose backend vanished without an event.
        self.pool.active_handles_into(&mut handles);
        for &handle in &handles {
            let Some(connection) = self.pool.get(handle) else {
                continue;
            };
            if !self.drivers.is_alive(connection.key()) {
                let connection = connection.clone();
                tracing::debug!(%handle, "Pruning dead connection");
                peer.on_disconnected(&connection, DisconnectReason::Shutdown);
                self.pool.release(handle);
            }
        }

        self.accept_pending(peer);

        self.pool.active_handles_into(&mut handles);
        for &handle in &handles {
            if let Some(key) = self.pool.get(handle).map(Connection::key) {
                self.drain(key, peer);
            }
        }

        self.handles = handles;
    }

    fn accept_pending<P: NetworkPeer + ?Sized>(&mut self, peer: &mut P) {
        while let Some((key, request)) = self.drivers.accept() {
            let remote = self.drivers.remote_addr(key);
            if self.pool.free_len() == 0 {
                tracing::warn!(
                    remote = ?remote,
                    capacity = self.pool.capacity(),
                    "Connection refused, server at capacity"
                );
                self.drivers.disconnect(key);
                continue;
            }
            if !peer.on_connect_request(&request, remote) {
                tracing::info!(remote = ?remote, "Connection request rejected");
                self.drivers.disconnect(key);
                continue;
            }
            self.admit(key, peer);
        }
    }

    /// Pool a backend connection and announce it.
    fn admit<P: NetworkPeer + ?Sized>(&mut self, key: ConnectionKey, peer: &mut P) {
        let Some(protocol) = self.drivers.protocol(key) else {
            return;
        };
        let remote = self.drivers.remote_addr(key);
        let max_payload = self.drivers.max_payload_size(key).unwrap_or(0);
        match self.pool.acquire(key, protocol, remote, max_payload) {
            Ok(handle) => {
                tracing::info!(%handle, %protocol, remote = ?remote, "Peer connected");
                if let Some(connection) = self.pool.get(handle) {
                    peer.on_connected(connection);
                }
            }
            Err(e) => {
                tracing::warn!(connection = %key, error = %e, "Could not pool connection");
                self.drivers.disconnect(key);
            }
        }
    }

    fn poll_client<P: NetworkPeer + ?Sized>(&mut self, peer: &mut P) {
        let Some(key) = self.server_key else {
            return;
        };

        if !self.drivers.is_alive(key) {
            self.server_key = None;
            match self.pool.lookup(key) {
                Some(handle) => {
                    if let Some(connection) = self.pool.get(handle).cloned() {
                        peer.on_disconnected(&connection, DisconnectReason::Shutdown);
                    }
                    self.pool.release(handle);
                }
                None => peer.on_connect_failed(DisconnectReason::Shutdown),
            }
            return;
        }

        if self.drain(key, peer) {
            self.server_key = None;
        }
    }

    /// Deliver every pending event of one backend connection. Returns `true`
    /// once the connection has ended.
    fn drain<P: NetworkPeer + ?Sized>(&mut self, key: ConnectionKey, peer: &mut P) -> bool {
        loop {
            let Some(event) = self.drivers.events(key).next() else {
                return false;
            };
            match event {
                DriverEvent::Connect => {
                    if self.pool.lookup(key).is_none() {
                        self.admit(key, peer);
                    }
                }
                DriverEvent::Data(bytes) => {
                    let Some(connection) = self.pool.lookup(key).and_then(|h| self.pool.get(h))
                    else {
                        tracing::trace!(connection = %key, "Payload for unpooled connection dropped");
                        continue;
                    };
                    match self.scratch.write(&bytes) {
                        Ok(payload) => peer.receive(connection, payload),
                        Err(e) => {
                            tracing::warn!(connection = %key, error = %e, "Payload dropped");
                        }
                    }
                }
                DriverEvent::Disconnect(reason) => {
                    match self.pool.lookup(key) {
                        Some(handle) => {
                            if let Some(connection) = self.pool.get(handle).cloned() {
                                tracing::info!(%handle, ?reason, "Peer disconnected");
                                peer.on_disconnected(&connection, reason);
                            }
                            self.pool.release(handle);
                        }
                        None => {
                            tracing::info!(?reason, "Connect attempt failed");
                            peer.on_connect_failed(reason);
                        }
                    }
                    return true;
                }
            }
        }
    }
}
