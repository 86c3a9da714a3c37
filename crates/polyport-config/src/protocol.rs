//! Protocol selection primitives shared by configuration and the transport.
//!
//! A client picks exactly one [`ClientProtocol`]; a server enables any subset
//! of the concrete [`Protocol`]s through a [`ProtocolSet`]. Server backends
//! are always ordered by [`Protocol::CANONICAL`], which also decides the port
//! offset each backend binds to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A concrete transport flavor backed by one driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    /// Plain or DTLS-secured datagrams.
    Udp,
    /// WebSocket, optionally over TLS.
    WebSocket,
    /// Datagrams tunneled through a relay server.
    RelayUdp,
    /// WebSocket tunneled through a relay server.
    RelayWebSocket,
}

impl Protocol {
    /// Fixed order used to assign server ports and to iterate a [`ProtocolSet`].
    pub const CANONICAL: [Protocol; 4] = [
        Protocol::Udp,
        Protocol::WebSocket,
        Protocol::RelayUdp,
        Protocol::RelayWebSocket,
    ];

    /// Whether traffic for this protocol goes through a relay allocation.
    pub fn is_relay(self) -> bool {
        matches!(self, Protocol::RelayUdp | Protocol::RelayWebSocket)
    }

    /// Short lowercase name, as accepted on the command line.
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::WebSocket => "websocket",
            Protocol::RelayUdp => "relay-udp",
            Protocol::RelayWebSocket => "relay-websocket",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Protocol::Udp => 1 << 0,
            Protocol::WebSocket => 1 << 1,
            Protocol::RelayUdp => 1 << 2,
            Protocol::RelayWebSocket => 1 << 3,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a protocol name cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown protocol '{0}'")]
pub struct ParseProtocolError(pub String);

impl FromStr for Protocol {
    type Err = ParseProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            "ws" | "websocket" => Ok(Protocol::WebSocket),
            "relay-udp" => Ok(Protocol::RelayUdp),
            "relay-ws" | "relay-websocket" => Ok(Protocol::RelayWebSocket),
            other => Err(ParseProtocolError(other.to_string())),
        }
    }
}

/// Protocol a client uses to reach its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClientProtocol {
    /// No protocol selected. Running a client with this is an error.
    None,
    /// Connect over [`Protocol::Udp`].
    Udp,
    /// Connect over [`Protocol::WebSocket`].
    WebSocket,
    /// Connect over [`Protocol::RelayUdp`].
    RelayUdp,
    /// Connect over [`Protocol::RelayWebSocket`].
    RelayWebSocket,
    /// Let the platform capability table decide.
    #[default]
    Auto,
}

impl ClientProtocol {
    /// The concrete protocol this selects, if it names one directly.
    pub fn concrete(self) -> Option<Protocol> {
        match self {
            ClientProtocol::Udp => Some(Protocol::Udp),
            ClientProtocol::WebSocket => Some(Protocol::WebSocket),
            ClientProtocol::RelayUdp => Some(Protocol::RelayUdp),
            ClientProtocol::RelayWebSocket => Some(Protocol::RelayWebSocket),
            ClientProtocol::None | ClientProtocol::Auto => None,
        }
    }
}

impl FromStr for ClientProtocol {
    type Err = ParseProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ClientProtocol::None),
            "auto" => Ok(ClientProtocol::Auto),
            other => match Protocol::from_str(other)? {
                Protocol::Udp => Ok(ClientProtocol::Udp),
                Protocol::WebSocket => Ok(ClientProtocol::WebSocket),
                Protocol::RelayUdp => Ok(ClientProtocol::RelayUdp),
                Protocol::RelayWebSocket => Ok(ClientProtocol::RelayWebSocket),
            },
        }
    }
}

/// Bitset of server-side protocols.
///
/// Serialized as a list of protocols in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Protocol>", into = "Vec<Protocol>")]
pub struct ProtocolSet(u8);

impl ProtocolSet {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every protocol.
    pub fn all() -> Self {
        Protocol::CANONICAL.into_iter().collect()
    }

    /// Set containing exactly one protocol.
    pub fn only(protocol: Protocol) -> Self {
        Self(protocol.bit())
    }

    /// Add a protocol. Returns `true` if it was not already present.
    pub fn insert(&mut self, protocol: Protocol) -> bool {
        let absent = !self.contains(protocol);
        self.0 |= protocol.bit();
        absent
    }

    /// Remove a protocol. Returns `true` if it was present.
    pub fn remove(&mut self, protocol: Protocol) -> bool {
        let present = self.contains(protocol);
        self.0 &= !protocol.bit();
        present
    }

    /// Whether the protocol is enabled.
    pub fn contains(&self, protocol: Protocol) -> bool {
        self.0 & protocol.bit() != 0
    }

    /// Whether no protocol is enabled.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Number of enabled protocols.
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Enabled protocols in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = Protocol> + '_ {
        Protocol::CANONICAL
            .into_iter()
            .filter(|protocol| self.contains(*protocol))
    }

    /// Whether any enabled protocol goes through a relay.
    pub fn any_relay(&self) -> bool {
        self.iter().any(Protocol::is_relay)
    }
}

impl FromIterator<Protocol> for ProtocolSet {
    fn from_iter<I: IntoIterator<Item = Protocol>>(iter: I) -> Self {
        let mut set = ProtocolSet::empty();
        for protocol in iter {
            set.insert(protocol);
        }
        set
    }
}

impl From<Vec<Protocol>> for ProtocolSet {
    fn from(protocols: Vec<Protocol>) -> Self {
        protocols.into_iter().collect()
    }
}

impl From<ProtocolSet> for Vec<Protocol> {
    fn from(set: ProtocolSet) -> Self {
        set.iter().collect()
    }
}

impl FromStr for ProtocolSet {
    type Err = ParseProtocolError;

    /// Parse a comma separated list such as `udp,relay-ws`. `all` enables every protocol.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(ProtocolSet::all());
        }
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Protocol::from_str)
            .collect()
    }
}

/// What a server does when one of several enabled backends fails to bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BindFailurePolicy {
    /// Log the failure, drop that backend, and keep running with the rest.
    #[default]
    Skip,
    /// Tear down every backend and fail the run.
    Abort,
}
