//! Built-in connection-oriented driver over any datagram [`Link`].
//!
//! Connections are identified on the wire by a random `u64` token chosen by
//! the client. A client retries its `ConnectRequest` until the server answers
//! or the attempt budget runs out. Once established, both sides emit a `Ping`
//! after a period of send silence and drop the connection after a period of
//! receive silence.
//!
//! Server-side connections are acknowledged on the first [`update`] after
//! they were handed out by [`accept`], so a connection refused by the upper
//! layer is seen by the client as [`DisconnectReason::Rejected`].
//!
//! [`update`]: Driver::update
//! [`accept`]: Driver::accept

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use polyport_config::{Protocol, TuningConfig};

use crate::driver::{
    DisconnectReason, Driver, DriverConnectionId, DriverEvent, MAX_CONNECT_REQUEST_SIZE, MTU,
};
use crate::error::DriverError;
use crate::link::Link;
use crate::relay::RelayCredentials;
use crate::wire::{
    Frame, Packet, PLAIN_HEADER_SIZE, RECV_BUFFER_SIZE, RELAY_HEADER_SIZE, decode_frame,
    encode_frame,
};

#[derive(Debug, Clone, Copy)]
struct Timing {
    connect_timeout: Duration,
    max_connect_attempts: u32,
    disconnect_timeout: Duration,
    heartbeat: Duration,
}

impl Timing {
    fn from_tuning(tuning: &TuningConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(u64::from(tuning.connect_timeout_ms)),
            max_connect_attempts: tuning.max_connect_attempts.max(1),
            disconnect_timeout: Duration::from_millis(u64::from(tuning.disconnect_timeout_ms)),
            heartbeat: Duration::from_millis(u64::from(tuning.heartbeat_timeout_ms)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// Client waiting for `ConnectAccept`.
    Connecting,
    /// Server connection waiting in the accept queue.
    Pending,
    Connected,
    /// Closed by a timeout or the remote; the slot is freed once the
    /// `Disconnect` event is popped.
    Closed,
}

#[derive(Debug)]
struct Conn {
    token: u64,
    remote: SocketAddr,
    /// Where datagrams for this connection are sent: the remote itself, or
    /// the relay server in relay mode.
    route: SocketAddr,
    state: ConnState,
    request: Vec<u8>,
    attempts: u32,
    ack_pending: bool,
    last_send: Instant,
    last_recv: Instant,
    events: VecDeque<DriverEvent>,
}

impl Conn {
    fn new(token: u64, remote: SocketAddr, route: SocketAddr, state: ConnState, now: Instant) -> Self {
        Self {
            token,
            remote,
            route,
            state,
            request: Vec::new(),
            attempts: 0,
            ack_pending: false,
            last_send: now,
            last_recv: now,
            events: VecDeque::new(),
        }
    }

    fn close(&mut self, reason: DisconnectReason) {
        self.state = ConnState::Closed;
        self.events.push_back(DriverEvent::Disconnect(reason));
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    conn: Option<Conn>,
}

/// Encode and send one frame.
fn transmit<L: Link>(
    link: &mut L,
    buf: &mut [u8],
    allocation: Option<[u8; 16]>,
    to: SocketAddr,
    packet: Packet<'_>,
) -> Result<(), DriverError> {
    let len = encode_frame(&Frame { allocation, packet }, buf)?;
    link.send_to(&buf[..len], to)?;
    Ok(())
}

fn unspecified_like(remote: SocketAddr) -> SocketAddr {
    let ip = match remote.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

/// Connection-oriented driver over a datagram link.
#[derive(Debug)]
pub struct DatagramDriver<L: Link> {
    protocol: Protocol,
    link: L,
    timing: Timing,
    relay: Option<RelayCredentials>,
    listening: bool,
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_peer: HashMap<(SocketAddr, u64), u32>,
    accept_queue: VecDeque<(DriverConnectionId, Vec<u8>)>,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
}

impl<L: Link> DatagramDriver<L> {
    /// Unbound driver speaking `protocol` over `link`. With relay credentials
    /// every frame is routed through the relay server.
    pub fn new(
        protocol: Protocol,
        link: L,
        tuning: &TuningConfig,
        relay: Option<RelayCredentials>,
    ) -> Self {
        Self {
            protocol,
            link,
            timing: Timing::from_tuning(tuning),
            relay,
            listening: false,
            slots: Vec::new(),
            free: Vec::new(),
            by_peer: HashMap::new(),
            accept_queue: VecDeque::new(),
            recv_buf: vec![0; RECV_BUFFER_SIZE],
            send_buf: vec![0; RECV_BUFFER_SIZE],
        }
    }

    /// Pump I/O and timers as if the current time were `now`.
    pub fn update_at(&mut self, now: Instant) {
        self.receive(now);
        self.tick_timers(now);
    }

    /// Number of connection slots in use, including closed ones whose
    /// `Disconnect` event has not been popped yet.
    pub fn connection_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.conn.is_some()).count()
    }

    fn allocation(&self) -> Option<[u8; 16]> {
        self.relay.as_ref().map(|relay| relay.allocation_id)
    }

    fn route_for(&self, remote: SocketAddr) -> SocketAddr {
        self.relay.as_ref().map_or(remote, |relay| relay.server)
    }

    fn max_payload(&self) -> usize {
        MTU - self.max_header_size()
    }

    fn conn(&self, id: DriverConnectionId) -> Option<&Conn> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.conn.as_ref())
    }

    fn conn_mut(&mut self, id: DriverConnectionId) -> Option<&mut Conn> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.conn.as_mut())
    }

    fn allocate(&mut self, conn: Conn) -> DriverConnectionId {
        let key = (conn.route, conn.token);
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].conn = Some(conn);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    conn: Some(conn),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.by_peer.insert(key, index);
        DriverConnectionId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn free_slot(&mut self, index: u32) {
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return;
        };
        if let Some(conn) = slot.conn.take() {
            self.by_peer.remove(&(conn.route, conn.token));
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index);
        }
    }

    fn receive(&mut self, now: Instant) {
        if self.link.local_addr().is_none() {
            return;
        }

        let mut buf = std::mem::take(&mut self.recv_buf);
        loop {
            match self.link.recv_from(&mut buf) {
                Ok(Some((len, from))) => self.handle_datagram(&buf[..len], from, now),
                Ok(None) => break,
                // ICMP unreachable from an earlier send; not fatal for a datagram socket.
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    tracing::warn!(protocol = %self.protocol, error = %e, "Receive failed");
                    break;
                }
            }
        }
        self.recv_buf = buf;
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr, now: Instant) {
        let frame = match decode_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::trace!(%from, error = %e, "Dropping undecodable datagram");
                return;
            }
        };
        if frame.allocation.is_some() != self.relay.is_some() {
            tracing::trace!(%from, "Dropping datagram with mismatched relay allocation");
            return;
        }

        let token = match frame.packet {
            Packet::ConnectRequest { token, payload } => {
                self.on_connect_request(token, payload, from, now);
                return;
            }
            Packet::RelayBind { .. } => {
                tracing::trace!(%from, "Ignoring relay bind");
                return;
            }
            ref packet => match packet.token() {
                Some(token) => token,
                None => return,
            },
        };

        let Some(&index) = self.by_peer.get(&(from, token)) else {
            tracing::trace!(%from, token, "Datagram for unknown connection");
            return;
        };
        let Some(conn) = self.slots[index as usize].conn.as_mut() else {
            return;
        };
        if conn.state == ConnState::Closed {
            return;
        }
        conn.last_recv = now;

        match frame.packet {
            Packet::ConnectAccept { .. } => {
                if conn.state == ConnState::Connecting {
                    conn.state = ConnState::Connected;
                    conn.events.push_back(DriverEvent::Connect);
                    tracing::debug!(protocol = %self.protocol, remote = %conn.remote, "Connection established");
                }
            }
            Packet::Data { payload, .. } => {
                // Data before the accept means the accept was lost or reordered.
                if conn.state == ConnState::Connecting {
                    conn.state = ConnState::Connected;
                    conn.events.push_back(DriverEvent::Connect);
                }
                conn.events.push_back(DriverEvent::Data(payload.to_vec()));
            }
            Packet::Disconnect { .. } => {
                let reason = if conn.state == ConnState::Connecting {
                    DisconnectReason::Rejected
                } else {
                    DisconnectReason::ClosedByRemote
                };
                tracing::debug!(protocol = %self.protocol, remote = %conn.remote, ?reason, "Remote closed connection");
                conn.close(reason);
            }
            Packet::Ping { .. } | Packet::ConnectRequest { .. } | Packet::RelayBind { .. } => {}
        }
    }

    fn on_connect_request(&mut self, token: u64, payload: &[u8], from: SocketAddr, now: Instant) {
        if !self.listening {
            tracing::trace!(%from, "Not listening, connect request ignored");
            return;
        }

        let allocation = self.allocation();
        if let Some(&index) = self.by_peer.get(&(from, token)) {
            // Retransmitted request: our accept was lost.
            if let Some(conn) = self.slots[index as usize].conn.as_mut() {
                conn.last_recv = now;
                if conn.state == ConnState::Connected && !conn.ack_pending {
                    conn.last_send = now;
                    let packet = Packet::ConnectAccept { token };
                    if let Err(e) =
                        transmit(&mut self.link, &mut self.send_buf, allocation, from, packet)
                    {
                        tracing::debug!(%from, error = %e, "Failed to resend accept");
                    }
                }
            }
            return;
        }

        if payload.len() > MAX_CONNECT_REQUEST_SIZE {
            tracing::debug!(%from, size = payload.len(), "Oversized connect request dropped");
            return;
        }

        let id = self.allocate(Conn::new(token, from, from, ConnState::Pending, now));
        self.accept_queue.push_back((id, payload.to_vec()));
        tracing::debug!(protocol = %self.protocol, %from, %id, "Incoming connection");
    }

    fn tick_timers(&mut self, now: Instant) {
        let allocation = self.allocation();
        let timing = self.timing;

        for slot in &mut self.slots {
            let Some(conn) = slot.conn.as_mut() else {
                continue;
            };

            let packet = match conn.state {
                ConnState::Closed => continue,
                ConnState::Connecting => {
                    if now.saturating_duration_since(conn.last_send) < timing.connect_timeout {
                        continue;
                    }
                    if conn.attempts >= timing.max_connect_attempts {
                        tracing::info!(
                            protocol = %self.protocol,
                            remote = %conn.remote,
                            attempts = conn.attempts,
                            "Connection attempts exhausted"
                        );
                        conn.close(DisconnectReason::MaxConnectionAttempts);
                        continue;
                    }
                    conn.attempts += 1;
                    Packet::ConnectRequest {
                        token: conn.token,
                        payload: &conn.request,
                    }
                }
                ConnState::Pending | ConnState::Connected => {
                    if now.saturating_duration_since(conn.last_recv) >= timing.disconnect_timeout {
                        tracing::info!(protocol = %self.protocol, remote = %conn.remote, "Connection timed out");
                        conn.close(DisconnectReason::Timeout);
                        continue;
                    }
                    if conn.ack_pending {
                        conn.ack_pending = false;
                        Packet::ConnectAccept { token: conn.token }
                    } else if conn.state == ConnState::Connected
                        && now.saturating_duration_since(conn.last_send) >= timing.heartbeat
                    {
                        Packet::Ping { token: conn.token }
                    } else {
                        continue;
                    }
                }
            };

            let route = conn.route;
            let result = transmit(&mut self.link, &mut self.send_buf, allocation, route, packet);
            conn.last_send = now;
            if let Err(e) = result {
                tracing::debug!(protocol = %self.protocol, %route, error = %e, "Timer send failed");
            }
        }
    }
}

impl<L: Link> Driver for DatagramDriver<L> {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn bind(&mut self, addr: SocketAddr) -> Result<SocketAddr, DriverError> {
        let bound = self.link.bind(addr)?;
        tracing::debug!(protocol = %self.protocol, %bound, "Driver bound");
        Ok(bound)
    }

    fn listen(&mut self) -> Result<(), DriverError> {
        let local = self.link.local_addr().ok_or(DriverError::NotBound)?;
        if let Some(relay) = &self.relay {
            let packet = Packet::RelayBind {
                connection_data: &relay.connection_data,
                host_connection_data: None,
            };
            transmit(
                &mut self.link,
                &mut self.send_buf,
                Some(relay.allocation_id),
                relay.server,
                packet,
            )?;
        }
        self.listening = true;
        tracing::info!(protocol = %self.protocol, %local, "Listening");
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.link.local_addr()
    }

    fn connect(
        &mut self,
        remote: SocketAddr,
        request: Option<&[u8]>,
    ) -> Result<DriverConnectionId, DriverError> {
        let request = request.unwrap_or_default();
        if request.len() > MAX_CONNECT_REQUEST_SIZE {
            return Err(DriverError::PayloadTooLarge {
                size: request.len(),
                max: MAX_CONNECT_REQUEST_SIZE,
            });
        }
        if self.link.local_addr().is_none() {
            self.link.bind(unspecified_like(remote))?;
        }

        let route = self.route_for(remote);
        let token = rand::random::<u64>();
        if let Some(relay) = &self.relay {
            let packet = Packet::RelayBind {
                connection_data: &relay.connection_data,
                host_connection_data: relay.host_connection_data.as_deref(),
            };
            transmit(
                &mut self.link,
                &mut self.send_buf,
                Some(relay.allocation_id),
                relay.server,
                packet,
            )?;
        }
        let allocation = self.allocation();
        transmit(
            &mut self.link,
            &mut self.send_buf,
            allocation,
            route,
            Packet::ConnectRequest {
                token,
                payload: request,
            },
        )?;

        let mut conn = Conn::new(token, remote, route, ConnState::Connecting, Instant::now());
        conn.request = request.to_vec();
        conn.attempts = 1;
        let id = self.allocate(conn);
        tracing::debug!(protocol = %self.protocol, %remote, %id, "Connecting");
        Ok(id)
    }

    fn disconnect(&mut self, id: DriverConnectionId) {
        let allocation = self.allocation();
        let Some(conn) = self.conn(id) else {
            return;
        };
        if conn.state != ConnState::Closed {
            let (route, token) = (conn.route, conn.token);
            if let Err(e) = transmit(
                &mut self.link,
                &mut self.send_buf,
                allocation,
                route,
                Packet::Disconnect { token },
            ) {
                tracing::debug!(%route, error = %e, "Failed to send disconnect");
            }
        }
        self.free_slot(id.index);
    }

    fn is_alive(&self, id: DriverConnectionId) -> bool {
        self.conn(id).is_some()
    }

    fn update(&mut self) {
        self.update_at(Instant::now());
    }

    fn accept(&mut self) -> Option<(DriverConnectionId, Vec<u8>)> {
        while let Some((id, request)) = self.accept_queue.pop_front() {
            match self.conn_mut(id) {
                Some(conn) if conn.state == ConnState::Pending => {
                    conn.state = ConnState::Connected;
                    conn.ack_pending = true;
                    return Some((id, request));
                }
                // Timed out or closed by the client before anyone accepted it.
                Some(_) => self.free_slot(id.index),
                None => {}
            }
        }
        None
    }

    fn pop_event(&mut self, id: DriverConnectionId) -> Option<DriverEvent> {
        let event = self.conn_mut(id)?.events.pop_front()?;
        if matches!(event, DriverEvent::Disconnect(_)) {
            self.free_slot(id.index);
        }
        Some(event)
    }

    fn send(&mut self, id: DriverConnectionId, payload: &[u8]) -> Result<(), DriverError> {
        let max = self.max_payload();
        if payload.len() > max {
            return Err(DriverError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let allocation = self.allocation();
        let conn = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.conn.as_mut())
            .ok_or(DriverError::InvalidConnection)?;
        if conn.state != ConnState::Connected {
            return Err(DriverError::NotConnected);
        }

        let packet = Packet::Data {
            token: conn.token,
            payload,
        };
        transmit(&mut self.link, &mut self.send_buf, allocation, conn.route, packet)?;
        conn.last_send = Instant::now();
        Ok(())
    }

    fn remote_addr(&self, id: DriverConnectionId) -> Option<SocketAddr> {
        self.conn(id).map(|conn| conn.remote)
    }

    fn max_header_size(&self) -> usize {
        if self.relay.is_some() {
            RELAY_HEADER_SIZE
        } else {
            PLAIN_HEADER_SIZE
        }
    }

    fn dispose(&mut self) {
        let allocation = self.allocation();
        self.free.clear();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(conn) = slot.conn.take() {
                if conn.state != ConnState::Closed {
                    let packet = Packet::Disconnect { token: conn.token };
                    if let Err(e) =
                        transmit(&mut self.link, &mut self.send_buf, allocation, conn.route, packet)
                    {
                        tracing::debug!(route = %conn.route, error = %e, "Failed to send disconnect");
                    }
                }
                slot.generation = slot.generation.wrapping_add(1);
            }
            self.free.push(index as u32);
        }
        self.by_peer.clear();
        self.accept_queue.clear();
        self.listening = false;
        self.link.close();
        tracing::debug!(protocol = %self.protocol, "Driver disposed");
    }
}
