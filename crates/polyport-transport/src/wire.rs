//! Datagram wire format of the built-in driver.
//!
//! Every datagram is `[version: u8] [postcard-encoded Frame]`. Payloads are
//! borrowed from the receive buffer while decoding, so nothing is copied
//! until a payload is queued as an event.

use serde::{Deserialize, Serialize};

/// Current datagram format version. Frames carrying another version are dropped.
pub const WIRE_VERSION: u8 = 1;

/// Worst-case frame overhead without a relay allocation id: version byte,
/// option tag, variant tag, varint token and varint payload length.
pub const PLAIN_HEADER_SIZE: usize = 16;

/// Worst-case frame overhead when every frame carries a relay allocation id.
pub const RELAY_HEADER_SIZE: usize = PLAIN_HEADER_SIZE + 16;

/// Size of the receive buffer. Larger datagrams are truncated by the OS and
/// fail to decode.
pub const RECV_BUFFER_SIZE: usize = 2048;

/// One datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame<'a> {
    /// Relay allocation the frame belongs to, in relay mode.
    pub allocation: Option<[u8; 16]>,
    /// The packet itself.
    #[serde(borrow)]
    pub packet: Packet<'a>,
}

/// Packet kinds. `token` identifies the connection on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet<'a> {
    /// Client opens a connection, optionally carrying a request payload.
    ConnectRequest { token: u64, payload: &'a [u8] },
    /// Server accepts a connection.
    ConnectAccept { token: u64 },
    /// Application payload.
    Data { token: u64, payload: &'a [u8] },
    /// Keep-alive.
    Ping { token: u64 },
    /// Either side closes the connection.
    Disconnect { token: u64 },
    /// Announces this peer's connection data to the relay server. A joining
    /// client also names the host it wants to reach.
    RelayBind {
        connection_data: &'a [u8],
        #[serde(borrow)]
        host_connection_data: Option<&'a [u8]>,
    },
}

impl Packet<'_> {
    /// Connection token, for packets that belong to a connection.
    pub fn token(&self) -> Option<u64> {
        match *self {
            Packet::ConnectRequest { token, .. }
            | Packet::ConnectAccept { token }
            | Packet::Data { token, .. }
            | Packet::Ping { token }
            | Packet::Disconnect { token } => Some(token),
            Packet::RelayBind { .. } => None,
        }
    }
}

/// Errors that can occur while decoding a datagram.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The datagram was empty (no version byte).
    #[error("empty datagram")]
    Empty,

    /// The version byte does not match [`WIRE_VERSION`].
    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard decoding failed.
    #[error("decode error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Encode a frame into `buf`, returning the number of bytes written.
pub fn encode_frame(frame: &Frame<'_>, buf: &mut [u8]) -> Result<usize, postcard::Error> {
    let Some((version, body)) = buf.split_first_mut() else {
        return Err(postcard::Error::SerializeBufferFull);
    };
    *version = WIRE_VERSION;
    let written = postcard::to_slice(frame, body)?.len();
    Ok(1 + written)
}

/// Decode a datagram, borrowing payloads from `data`.
pub fn decode_frame(data: &[u8]) -> Result<Frame<'_>, WireError> {
    let (&version, body) = data.split_first().ok_or(WireError::Empty)?;
    if version != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MTU;

    #[test]
    fn test_data_frame_borrows_payload() {
        let payload = [9u8; 64];
        let frame = Frame {
            allocation: None,
            packet: Packet::Data {
                token: 42,
                payload: &payload,
            },
        };
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let len = encode_frame(&frame, &mut buf).unwrap();
        assert_eq!(buf[0], WIRE_VERSION);

        let decoded = decode_frame(&buf[..len]).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.packet.token(), Some(42));
    }

    #[test]
    fn test_header_bounds_hold_for_max_payload() {
        let plain_payload = vec![1u8; MTU - PLAIN_HEADER_SIZE];
        let plain = Frame {
            allocation: None,
            packet: Packet::Data {
                token: u64::MAX,
                payload: &plain_payload,
            },
        };
        let relay_payload = vec![1u8; MTU - RELAY_HEADER_SIZE];
        let relay = Frame {
            allocation: Some([0xFF; 16]),
            packet: Packet::Data {
                token: u64::MAX,
                payload: &relay_payload,
            },
        };

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        assert!(encode_frame(&plain, &mut buf).unwrap() <= MTU);
        assert!(encode_frame(&relay, &mut buf).unwrap() <= MTU);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let frame = Frame {
            allocation: None,
            packet: Packet::Ping { token: 1 },
        };
        let mut buf = [0u8; 64];
        let len = encode_frame(&frame, &mut buf).unwrap();
        buf[0] = WIRE_VERSION + 1;
        assert!(matches!(
            decode_frame(&buf[..len]),
            Err(WireError::UnsupportedVersion(v)) if v == WIRE_VERSION + 1
        ));
    }

    #[test]
    fn test_empty_and_garbage_rejected() {
        assert!(matches!(decode_frame(&[]), Err(WireError::Empty)));
        assert!(matches!(
            decode_frame(&[WIRE_VERSION, 0xFF, 0xFF]),
            Err(WireError::Postcard(_))
        ));
    }

    #[test]
    fn test_encode_into_small_buffer_fails() {
        let frame = Frame {
            allocation: Some([1; 16]),
            packet: Packet::Ping { token: 1 },
        };
        let mut buf = [0u8; 4];
        assert!(encode_frame(&frame, &mut buf).is_err());
        assert!(encode_frame(&frame, &mut []).is_err());
    }
}
