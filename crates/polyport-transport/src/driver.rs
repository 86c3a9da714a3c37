//! The backend capability surface and the factory that builds backends.
//!
//! A [`Driver`] is one backend: it owns a single bound endpoint, speaks a
//! single [`Protocol`], and is pumped once per tick through
//! [`Driver::update`]. Every call is non-blocking.

use std::fmt;
use std::net::SocketAddr;

use polyport_config::{Protocol, TuningConfig};

use crate::datagram::DatagramDriver;
use crate::error::{DriverError, TransportError};
use crate::ipc::{IpcHub, IpcLink};
use crate::link::UdpLink;
use crate::relay::RelayCredentials;
use crate::secure::SecurityParams;
use crate::selector::{InterfaceKind, Role};

/// Largest datagram any backend emits, headers included.
pub const MTU: usize = 1400;

/// Largest connection request payload a client may attach to `connect`.
pub const MAX_CONNECT_REQUEST_SIZE: usize = 200;

/// Backend-local connection identifier.
///
/// The generation changes every time the index is reused, so an id that
/// outlives its connection never addresses a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverConnectionId {
    /// Slot index inside the driver.
    pub index: u32,
    /// Generation of the slot when the connection was created.
    pub generation: u32,
}

impl fmt::Display for DriverConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The backend shut down or the connection vanished without a reason.
    Shutdown,
    /// Nothing was received within the disconnect timeout.
    Timeout,
    /// The handshake was never answered.
    MaxConnectionAttempts,
    /// The remote side closed the connection.
    ClosedByRemote,
    /// This side closed the connection.
    ClosedLocally,
    /// The server refused the connection.
    Rejected,
}

/// Event popped from a driver connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// The handshake completed (client side).
    Connect,
    /// A payload arrived.
    Data(Vec<u8>),
    /// The connection ended. Its id is invalid once this is popped.
    Disconnect(DisconnectReason),
}

/// One network backend.
pub trait Driver: Send {
    /// Protocol this backend speaks.
    fn protocol(&self) -> Protocol;

    /// Bind the local endpoint. Returns the address actually bound.
    fn bind(&mut self, addr: SocketAddr) -> Result<SocketAddr, DriverError>;

    /// Start accepting incoming connections on the bound endpoint.
    fn listen(&mut self) -> Result<(), DriverError>;

    /// Bound local endpoint, if any.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Start a handshake with `remote`, optionally carrying a request payload.
    fn connect(
        &mut self,
        remote: SocketAddr,
        request: Option<&[u8]>,
    ) -> Result<DriverConnectionId, DriverError>;

    /// Close a connection. The id is invalid afterwards and no event is queued.
    fn disconnect(&mut self, id: DriverConnectionId);

    /// Whether `id` still names a connection of this driver.
    fn is_alive(&self, id: DriverConnectionId) -> bool;

    /// Pump network I/O and timers. Never blocks.
    fn update(&mut self);

    /// Next connection accepted since the last call, with its request payload.
    fn accept(&mut self) -> Option<(DriverConnectionId, Vec<u8>)>;

    /// Next pending event of a connection.
    fn pop_event(&mut self, id: DriverConnectionId) -> Option<DriverEvent>;

    /// Send one payload on an established connection.
    fn send(&mut self, id: DriverConnectionId, payload: &[u8]) -> Result<(), DriverError>;

    /// Remote endpoint of a connection.
    fn remote_addr(&self, id: DriverConnectionId) -> Option<SocketAddr>;

    /// Per-datagram overhead, subtracted from [`MTU`] to get the payload limit.
    fn max_header_size(&self) -> usize;

    /// Close every connection and release the endpoint.
    fn dispose(&mut self);
}

/// Everything a factory needs to build one backend.
#[derive(Debug, Clone, Copy)]
pub struct BackendSettings<'a> {
    /// Protocol of the backend.
    pub protocol: Protocol,
    /// Interface the platform provides for that protocol.
    pub interface: InterfaceKind,
    /// Role of the run.
    pub role: Role,
    /// Raw tuning parameters, passed through unchanged.
    pub tuning: &'a TuningConfig,
    /// Security parameters of the run.
    pub security: &'a SecurityParams,
    /// Relay credentials, for relay protocols.
    pub relay: Option<&'a RelayCredentials>,
}

/// Builds backends. Creating a backend must not open sockets.
pub trait DriverFactory: Send {
    /// Build an unbound backend for the given settings.
    fn create(&self, settings: &BackendSettings<'_>) -> Result<Box<dyn Driver>, TransportError>;
}

/// Factory for the built-in datagram backends.
///
/// Datagram interfaces run over [`UdpLink`] or, for in-process interfaces,
/// over the factory's [`IpcHub`]. WebSocket interfaces and encrypted runs
/// need a factory that supplies such backends.
#[derive(Debug, Clone, Default)]
pub struct DefaultDriverFactory {
    ipc: IpcHub,
}

impl DefaultDriverFactory {
    /// Factory whose in-process backends share the given hub.
    pub fn with_hub(ipc: IpcHub) -> Self {
        Self { ipc }
    }

    /// Hub used by in-process backends.
    pub fn hub(&self) -> &IpcHub {
        &self.ipc
    }
}

impl DriverFactory for DefaultDriverFactory {
    fn create(&self, settings: &BackendSettings<'_>) -> Result<Box<dyn Driver>, TransportError> {
        if settings.security.is_encrypted() {
            return Err(TransportError::EncryptionUnsupported {
                protocol: settings.protocol,
            });
        }

        let relay = settings.relay.cloned();
        match settings.interface {
            InterfaceKind::Udp => Ok(Box::new(DatagramDriver::new(
                settings.protocol,
                UdpLink::new(settings.tuning),
                settings.tuning,
                relay,
            ))),
            InterfaceKind::Ipc => Ok(Box::new(DatagramDriver::new(
                settings.protocol,
                IpcLink::new(self.ipc.clone()),
                settings.tuning,
                relay,
            ))),
            InterfaceKind::WebSocket => Err(TransportError::UnsupportedInterface(settings.protocol)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings<'a>(
        protocol: Protocol,
        interface: InterfaceKind,
        tuning: &'a TuningConfig,
        security: &'a SecurityParams,
    ) -> BackendSettings<'a> {
        BackendSettings {
            protocol,
            interface,
            role: Role::Server,
            tuning,
            security,
            relay: None,
        }
    }

    #[test]
    fn test_factory_builds_unbound_datagram_driver() {
        let tuning = TuningConfig::default();
        let factory = DefaultDriverFactory::default();
        let driver = factory
            .create(&settings(
                Protocol::Udp,
                InterfaceKind::Ipc,
                &tuning,
                &SecurityParams::Plain,
            ))
            .unwrap();
        assert_eq!(driver.protocol(), Protocol::Udp);
        assert!(driver.local_addr().is_none());
        assert!(driver.max_header_size() < MTU);
    }

    #[test]
    fn test_factory_rejects_websocket() {
        let tuning = TuningConfig::default();
        let result = DefaultDriverFactory::default().create(&settings(
            Protocol::WebSocket,
            InterfaceKind::WebSocket,
            &tuning,
            &SecurityParams::Plain,
        ));
        assert!(matches!(
            result,
            Err(TransportError::UnsupportedInterface(Protocol::WebSocket))
        ));
    }

    #[test]
    fn test_factory_rejects_encryption() {
        let tuning = TuningConfig::default();
        let security = SecurityParams::Client {
            server_name: "game.example".to_string(),
            ca: None,
        };
        let result = DefaultDriverFactory::default().create(&settings(
            Protocol::Udp,
            InterfaceKind::Udp,
            &tuning,
            &security,
        ));
        assert!(matches!(
            result,
            Err(TransportError::EncryptionUnsupported {
                protocol: Protocol::Udp
            })
        ));
    }

    #[test]
    fn test_connection_id_display() {
        let id = DriverConnectionId {
            index: 3,
            generation: 2,
        };
        assert_eq!(id.to_string(), "3v2");
    }
}
