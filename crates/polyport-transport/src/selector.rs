//! Protocol selection: which backends a run needs and where they listen.
//!
//! Platform differences are expressed as a [`CapabilityTable`] rather than
//! conditional code paths, so the same planning logic can be exercised for
//! every platform in tests.

use polyport_config::{ClientProtocol, NetworkConfig, Protocol, ProtocolSet};

use crate::error::TransportError;

/// Which side of a connection a run plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Listens on every enabled protocol and accepts peers.
    Server,
    /// Connects to a single server over one protocol.
    Client,
}

impl Role {
    /// Lowercase name used in errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

/// Build target family, as far as available socket types are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Desktop, console and mobile targets with OS datagram sockets.
    Native,
    /// Browser targets, limited to WebSocket and in-process loopback.
    Browser,
}

impl Platform {
    /// Platform of the current compilation target.
    pub fn current() -> Self {
        if cfg!(target_arch = "wasm32") {
            Platform::Browser
        } else {
            Platform::Native
        }
    }
}

/// Kind of network interface a backend is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    /// OS datagram socket.
    Udp,
    /// In-process datagram loopback.
    Ipc,
    /// WebSocket stream.
    WebSocket,
}

/// Per-platform mapping from protocol to interface kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityTable {
    platform: Platform,
    auto_client: Protocol,
    interfaces: [InterfaceKind; 4],
}

impl CapabilityTable {
    /// Capabilities of a given platform.
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Native => Self {
                platform,
                auto_client: Protocol::Udp,
                interfaces: [
                    InterfaceKind::Udp,
                    InterfaceKind::WebSocket,
                    InterfaceKind::Udp,
                    InterfaceKind::WebSocket,
                ],
            },
            Platform::Browser => Self {
                platform,
                auto_client: Protocol::WebSocket,
                interfaces: [
                    InterfaceKind::Ipc,
                    InterfaceKind::WebSocket,
                    InterfaceKind::Ipc,
                    InterfaceKind::WebSocket,
                ],
            },
        }
    }

    /// Capabilities of the current compilation target.
    pub fn current() -> Self {
        Self::for_platform(Platform::current())
    }

    /// Every protocol runs over the in-process loopback. Used for tests and
    /// single-process hosting.
    pub fn in_process() -> Self {
        Self {
            platform: Platform::current(),
            auto_client: Protocol::Udp,
            interfaces: [InterfaceKind::Ipc; 4],
        }
    }

    /// Platform this table describes.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Protocol `ClientProtocol::Auto` resolves to.
    pub fn auto_client(&self) -> Protocol {
        self.auto_client
    }

    /// Interface a protocol's backend is built on.
    pub fn interface(&self, protocol: Protocol) -> InterfaceKind {
        let index = Protocol::CANONICAL
            .iter()
            .position(|p| *p == protocol)
            .unwrap_or(0);
        self.interfaces[index]
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::current()
    }
}

/// One backend a run needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendPlan {
    /// Protocol the backend speaks.
    pub protocol: Protocol,
    /// Port a server backend binds. `None` for client backends.
    pub port: Option<u16>,
}

/// Resolve the single protocol a client run uses.
pub fn resolve_client_protocol(
    selection: ClientProtocol,
    table: &CapabilityTable,
) -> Result<Protocol, TransportError> {
    match selection {
        ClientProtocol::None => Err(TransportError::NoClientProtocol),
        ClientProtocol::Auto => Ok(table.auto_client()),
        other => other.concrete().ok_or(TransportError::NoClientProtocol),
    }
}

/// Plan the server backends: one per enabled protocol, in canonical order,
/// each on the next port after `base_port`. Every port must fit in `u16`.
pub fn plan_server(
    protocols: &ProtocolSet,
    base_port: u16,
) -> Result<Vec<BackendPlan>, TransportError> {
    if protocols.is_empty() {
        return Err(TransportError::EmptyServerProtocols);
    }
    protocols
        .iter()
        .enumerate()
        .map(|(offset, protocol)| {
            let port = u16::try_from(offset)
                .ok()
                .and_then(|offset| base_port.checked_add(offset))
                .ok_or(TransportError::PortOutOfRange {
                    protocol,
                    base_port,
                })?;
            Ok(BackendPlan {
                protocol,
                port: Some(port),
            })
        })
        .collect()
}

/// Plan the backends for a run of the given role.
pub fn plan(
    role: Role,
    network: &NetworkConfig,
    table: &CapabilityTable,
) -> Result<Vec<BackendPlan>, TransportError> {
    match role {
        Role::Server => plan_server(&network.server_protocols, network.base_port),
        Role::Client => {
            let protocol = resolve_client_protocol(network.client_protocol, table)?;
            Ok(vec![BackendPlan {
                protocol,
                port: None,
            }])
        }
    }
}
