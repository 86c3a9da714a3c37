//! Connection-oriented transport multiplexer.
//!
//! A [`Transport`] runs one or more backend [`Driver`]s side by side (plain
//! UDP, WebSocket, and their relay variants), exposes them to the upper layer
//! as a single pool of [`Connection`]s, and turns backend events into
//! [`NetworkPeer`] callbacks once per tick.

pub mod aggregator;
pub mod datagram;
pub mod driver;
pub mod error;
pub mod ipc;
pub mod link;
pub mod peer;
pub mod pool;
pub mod relay;
pub mod scratch;
pub mod secure;
pub mod selector;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod transport_tests;

pub use aggregator::{ConnectionKey, DriverIndex, MultiDriver};
pub use driver::{
    BackendSettings, DefaultDriverFactory, DisconnectReason, Driver, DriverConnectionId,
    DriverEvent, DriverFactory, MAX_CONNECT_REQUEST_SIZE, MTU,
};
pub use error::{DriverError, TransportError};
pub use ipc::IpcHub;
pub use peer::NetworkPeer;
pub use pool::{Connection, ConnectionHandle, ConnectionPool, PoolError, PoolStats};
pub use relay::RelayCredentials;
pub use scratch::{BitReader, Payload, ScratchBuffer, ScratchError};
pub use secure::{SecurityParams, configure_security};
pub use selector::{
    BackendPlan, CapabilityTable, InterfaceKind, Platform, Role, plan, plan_server,
    resolve_client_protocol,
};
pub use transport::{RunOptions, Transport, TransportSettings};
