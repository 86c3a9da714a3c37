//! In-process datagram loopback.
//!
//! An [`IpcHub`] is a set of mailboxes keyed by port. Every [`IpcLink`]
//! created from the same hub can reach the others; links on different hubs
//! are isolated. Delivery is ordered and lossless, except that datagrams sent
//! to a port nobody bound are dropped.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::link::Link;

const EPHEMERAL_START: u16 = 49152;

#[derive(Debug)]
struct HubInner {
    mailboxes: HashMap<u16, VecDeque<(SocketAddr, Vec<u8>)>>,
    next_ephemeral: u16,
}

impl Default for HubInner {
    fn default() -> Self {
        Self {
            mailboxes: HashMap::new(),
            next_ephemeral: EPHEMERAL_START,
        }
    }
}

/// Shared mailbox registry. Clones refer to the same hub.
#[derive(Debug, Clone, Default)]
pub struct IpcHub {
    inner: Arc<Mutex<HubInner>>,
}

impl IpcHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim a port. Port 0 picks a free ephemeral port.
    pub fn claim(&self, port: u16) -> io::Result<u16> {
        let mut inner = self.lock();
        let port = if port == 0 {
            let mut candidate = inner.next_ephemeral;
            let mut tries = 0u32;
            while inner.mailboxes.contains_key(&candidate) {
                candidate = candidate.checked_add(1).unwrap_or(EPHEMERAL_START);
                tries += 1;
                if tries > u32::from(u16::MAX - EPHEMERAL_START) {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        "no free ephemeral port",
                    ));
                }
            }
            inner.next_ephemeral = candidate.checked_add(1).unwrap_or(EPHEMERAL_START);
            candidate
        } else {
            port
        };

        if inner.mailboxes.contains_key(&port) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("ipc port {port} already bound"),
            ));
        }
        inner.mailboxes.insert(port, VecDeque::new());
        Ok(port)
    }

    /// Release a port, discarding anything still queued for it.
    pub fn release(&self, port: u16) {
        self.lock().mailboxes.remove(&port);
    }

    /// Whether a port is currently bound.
    pub fn is_bound(&self, port: u16) -> bool {
        self.lock().mailboxes.contains_key(&port)
    }

    fn deliver(&self, from: SocketAddr, to: u16, bytes: &[u8]) -> bool {
        match self.lock().mailboxes.get_mut(&to) {
            Some(mailbox) => {
                mailbox.push_back((from, bytes.to_vec()));
                true
            }
            None => false,
        }
    }

    fn take(&self, port: u16) -> Option<(SocketAddr, Vec<u8>)> {
        self.lock().mailboxes.get_mut(&port)?.pop_front()
    }
}

/// Address every in-process endpoint reports.
pub fn loopback_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Datagram link over an [`IpcHub`]. Only the port of an address matters.
#[derive(Debug)]
pub struct IpcLink {
    hub: IpcHub,
    port: Option<u16>,
}

impl IpcLink {
    /// Unbound link on `hub`.
    pub fn new(hub: IpcHub) -> Self {
        Self { hub, port: None }
    }
}

impl Link for IpcLink {
    fn bind(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        if self.port.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "link is already bound",
            ));
        }
        let port = self.hub.claim(addr.port())?;
        self.port = Some(port);
        Ok(loopback_addr(port))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.port.map(loopback_addr)
    }

    fn send_to(&mut self, bytes: &[u8], addr: SocketAddr) -> io::Result<()> {
        let port = self
            .port
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "link is not bound"))?;
        if !self.hub.deliver(loopback_addr(port), addr.port(), bytes) {
            tracing::trace!(%addr, "No ipc endpoint bound, datagram dropped");
        }
        Ok(())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let Some(port) = self.port else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "link is not bound",
            ));
        };
        Ok(self.hub.take(port).map(|(from, bytes)| {
            let len = bytes.len().min(buf.len());
            buf[..len].copy_from_slice(&bytes[..len]);
            (len, from)
        }))
    }

    fn close(&mut self) {
        if let Some(port) = self.port.take() {
            self.hub.release(port);
        }
    }
}

impl Drop for IpcLink {
    fn drop(&mut self) {
        self.close();
    }
}
