//! Presents several backend drivers as one.
//!
//! Connections are addressed by a [`ConnectionKey`]: the index of the driver
//! that owns them plus the driver-local id. Drivers are pumped and polled in
//! the order they were added, which for a server is the canonical protocol
//! order.

use std::fmt;
use std::net::SocketAddr;

use polyport_config::Protocol;

use crate::driver::{Driver, DriverConnectionId, DriverEvent, MTU};
use crate::error::{DriverError, TransportError};

/// Position of a driver inside a [`MultiDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverIndex(pub usize);

/// Aggregated connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Driver owning the connection.
    pub driver: DriverIndex,
    /// Connection id inside that driver.
    pub id: DriverConnectionId,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}:{}", self.driver.0, self.id)
    }
}

/// A set of drivers driven as one.
#[derive(Default)]
pub struct MultiDriver {
    drivers: Vec<Box<dyn Driver>>,
    disposed: bool,
}

impl MultiDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a driver. Returns its index.
    pub fn add_driver(&mut self, driver: Box<dyn Driver>) -> DriverIndex {
        self.drivers.push(driver);
        DriverIndex(self.drivers.len() - 1)
    }

    /// Number of drivers.
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Index of the first driver speaking `protocol`.
    pub fn find(&self, protocol: Protocol) -> Option<DriverIndex> {
        self.drivers
            .iter()
            .position(|driver| driver.protocol() == protocol)
            .map(DriverIndex)
    }

    /// Bind `driver` to `addr`, start listening, and add it.
    ///
    /// A driver that fails either step is disposed and never added.
    pub fn bind_and_listen(
        &mut self,
        mut driver: Box<dyn Driver>,
        addr: SocketAddr,
    ) -> Result<(DriverIndex, SocketAddr), DriverError> {
        let result = driver
            .bind(addr)
            .and_then(|bound| driver.listen().map(|()| bound));
        match result {
            Ok(bound) => Ok((self.add_driver(driver), bound)),
            Err(e) => {
                driver.dispose();
                Err(e)
            }
        }
    }

    /// Open a connection through the driver speaking `protocol`.
    pub fn connect(
        &mut self,
        protocol: Protocol,
        endpoint: SocketAddr,
        request: Option<&[u8]>,
    ) -> Result<ConnectionKey, TransportError> {
        let index = self
            .find(protocol)
            .ok_or(TransportError::NoDriverForProtocol(protocol))?;
        let id = self.drivers[index.0].connect(endpoint, request)?;
        Ok(ConnectionKey { driver: index, id })
    }

    pub fn disconnect(&mut self, key: ConnectionKey) {
        if let Some(driver) = self.drivers.get_mut(key.driver.0) {
            driver.disconnect(key.id);
        }
    }

    pub fn is_alive(&self, key: ConnectionKey) -> bool {
        self.drivers
            .get(key.driver.0)
            .is_some_and(|driver| driver.is_alive(key.id))
    }

    /// Send one payload. Dead connections are skipped silently; driver
    /// failures are logged and otherwise ignored.
    pub fn send(&mut self, key: ConnectionKey, payload: &[u8]) {
        let Some(driver) = self.drivers.get_mut(key.driver.0) else {
            return;
        };
        if !driver.is_alive(key.id) {
            return;
        }
        if let Err(e) = driver.send(key.id, payload) {
            tracing::warn!(
                protocol = %driver.protocol(),
                connection = %key,
                size = payload.len(),
                error = %e,
                "Send failed"
            );
        }
    }

    /// Pump every driver once.
    pub fn update(&mut self) {
        for driver in &mut self.drivers {
            driver.update();
        }
    }

    /// Next accepted connection across all drivers, in driver order.
    pub fn accept(&mut self) -> Option<(ConnectionKey, Vec<u8>)> {
        self.drivers
            .iter_mut()
            .enumerate()
            .find_map(|(index, driver)| {
                driver.accept().map(|(id, request)| {
                    (
                        ConnectionKey {
                            driver: DriverIndex(index),
                            id,
                        },
                        request,
                    )
                })
            })
    }

    /// Lazily drain the pending events of a connection.
    pub fn events(&mut self, key: ConnectionKey) -> DriverEvents<'_> {
        DriverEvents {
            driver: self.drivers.get_mut(key.driver.0),
            id: key.id,
        }
    }

    pub fn remote_addr(&self, key: ConnectionKey) -> Option<SocketAddr> {
        self.drivers.get(key.driver.0)?.remote_addr(key.id)
    }

    /// Protocol of the driver owning `key`.
    pub fn protocol(&self, key: ConnectionKey) -> Option<Protocol> {
        self.drivers.get(key.driver.0).map(|driver| driver.protocol())
    }

    /// Largest payload the driver owning `key` can send in one datagram.
    pub fn max_payload_size(&self, key: ConnectionKey) -> Option<usize> {
        self.drivers
            .get(key.driver.0)
            .map(|driver| MTU.saturating_sub(driver.max_header_size()))
    }

    /// Largest payload any driver can deliver.
    pub fn max_payload_capacity(&self) -> usize {
        self.drivers
            .iter()
            .map(|driver| MTU.saturating_sub(driver.max_header_size()))
            .max()
            .unwrap_or(0)
    }

    /// Protocol and local endpoint of every bound driver.
    pub fn bound_endpoints(&self) -> Vec<(Protocol, SocketAddr)> {
        self.drivers
            .iter()
            .filter_map(|driver| driver.local_addr().map(|addr| (driver.protocol(), addr)))
            .collect()
    }

    /// Dispose every driver. Later calls do nothing.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for driver in &mut self.drivers {
            driver.dispose();
        }
        tracing::debug!(drivers = self.drivers.len(), "Drivers disposed");
    }
}

impl Drop for MultiDriver {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for MultiDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiDriver")
            .field(
                "drivers",
                &self.drivers.iter().map(|d| d.protocol()).collect::<Vec<_>>(),
            )
            .field("disposed", &self.disposed)
            .finish()
    }
}

/// Iterator over the pending events of one connection.
pub struct DriverEvents<'a> {
    driver: Option<&'a mut Box<dyn Driver>>,
    id: DriverConnectionId,
}

impl Iterator for DriverEvents<'_> {
    type Item = DriverEvent;

    fn next(&mut self) -> Option<DriverEvent> {
        self.driver.as_mut()?.pop_event(self.id)
    }
}
