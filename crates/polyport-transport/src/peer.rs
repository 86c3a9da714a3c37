//! Callbacks the transport delivers to the layer above it.

use std::net::SocketAddr;

use crate::driver::DisconnectReason;
use crate::pool::Connection;
use crate::scratch::Payload;

/// Receiver of connection lifecycle events and payloads.
///
/// All callbacks run synchronously inside
/// [`Transport::poll_events`](crate::Transport::poll_events) or
/// [`Transport::disconnect`](crate::Transport::disconnect).
pub trait NetworkPeer {
    /// A client asks to join. Returning `false` refuses it and no connection
    /// object is created. Only called while the pool has a free slot.
    fn on_connect_request(&mut self, request: &[u8], remote: Option<SocketAddr>) -> bool {
        let _ = (request, remote);
        true
    }

    /// A connection was established and added to the pool.
    fn on_connected(&mut self, connection: &Connection);

    /// A pooled connection ended. The handle stops resolving right after.
    fn on_disconnected(&mut self, connection: &Connection, reason: DisconnectReason);

    /// A client connect attempt ended before the connection was established.
    fn on_connect_failed(&mut self, reason: DisconnectReason) {
        let _ = reason;
    }

    /// A payload arrived. `payload` is only valid for the duration of the call.
    fn receive(&mut self, connection: &Connection, payload: Payload<'_>);
}
