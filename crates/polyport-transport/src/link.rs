//! Non-blocking datagram links the built-in driver runs on.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use polyport_config::TuningConfig;
use socket2::{Domain, Socket, Type};

/// A bound, non-blocking datagram endpoint.
pub trait Link: Send {
    /// Bind to `addr`. Returns the address actually bound (port 0 resolves to an ephemeral port).
    fn bind(&mut self, addr: SocketAddr) -> io::Result<SocketAddr>;

    /// Bound address, if any.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Send one datagram.
    fn send_to(&mut self, bytes: &[u8], addr: SocketAddr) -> io::Result<()>;

    /// Receive one datagram. `Ok(None)` when nothing is pending.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Release the endpoint. Further sends fail until bound again.
    fn close(&mut self);
}

/// OS UDP socket.
#[derive(Debug)]
pub struct UdpLink {
    socket: Option<UdpSocket>,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
}

impl UdpLink {
    /// Unbound link using the socket buffer sizes from `tuning`.
    pub fn new(tuning: &TuningConfig) -> Self {
        Self {
            socket: None,
            recv_buffer_size: tuning.socket_recv_buffer_size,
            send_buffer_size: tuning.socket_send_buffer_size,
        }
    }

    fn socket(&self) -> io::Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "link is not bound"))
    }
}

impl Link for UdpLink {
    fn bind(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let socket = Socket::new(
            Domain::for_address(addr),
            Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;

        if !cfg!(target_os = "windows") {
            socket.set_reuse_address(true)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }

        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket: UdpSocket = socket.into();
        let bound = socket.local_addr()?;
        self.socket = Some(socket);
        Ok(bound)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn send_to(&mut self, bytes: &[u8], addr: SocketAddr) -> io::Result<()> {
        match self.socket()?.send_to(bytes, addr) {
            Ok(_) => Ok(()),
            // A full send buffer drops the datagram, same as loss on the wire.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::trace!(%addr, "Send buffer full, datagram dropped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket()?.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) {
        self.socket = None;
    }
}
