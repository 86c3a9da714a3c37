//! Relay allocation credentials.

use std::fmt;
use std::net::SocketAddr;

use crate::error::TransportError;

/// Pre-formed allocation data issued by an external relay service.
///
/// Supplied per run through [`RunOptions`](crate::RunOptions). The transport
/// never requests allocations itself.
#[derive(Clone, PartialEq, Eq)]
pub struct RelayCredentials {
    /// Relay server endpoint every frame is sent to.
    pub server: SocketAddr,
    /// Allocation this peer owns on the relay.
    pub allocation_id: [u8; 16],
    /// Opaque connection data announced to the relay on bind.
    pub connection_data: Vec<u8>,
    /// Connection data of the host a joining client wants to reach. Sent
    /// alongside `connection_data` when the client binds on the relay.
    pub host_connection_data: Option<Vec<u8>>,
    /// HMAC key for the allocation.
    pub key: Vec<u8>,
}

impl RelayCredentials {
    /// Reject credentials that cannot describe a real allocation.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.allocation_id == [0; 16] {
            return Err(TransportError::InvalidRelayCredentials(
                "allocation id is zero",
            ));
        }
        if self.connection_data.is_empty() {
            return Err(TransportError::InvalidRelayCredentials(
                "connection data is empty",
            ));
        }
        if self.key.is_empty() {
            return Err(TransportError::InvalidRelayCredentials("key is empty"));
        }
        Ok(())
    }
}

impl fmt::Debug for RelayCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayCredentials")
            .field("server", &self.server)
            .field("allocation_id", &self.allocation_id)
            .field("connection_data_len", &self.connection_data.len())
            .field(
                "host_connection_data_len",
                &self.host_connection_data.as_ref().map(Vec::len),
            )
            .field("key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_credentials(server: SocketAddr) -> RelayCredentials {
    RelayCredentials {
        server,
        allocation_id: [7; 16],
        connection_data: vec![1, 2, 3],
        host_connection_data: None,
        key: vec![0xAB; 32],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_addr() -> SocketAddr {
        "10.0.0.1:3478".parse().unwrap()
    }

    #[test]
    fn test_valid_credentials() {
        assert!(test_credentials(relay_addr()).validate().is_ok());
    }

    #[test]
    fn test_zero_allocation_rejected() {
        let creds = RelayCredentials {
            allocation_id: [0; 16],
            ..test_credentials(relay_addr())
        };
        assert!(matches!(
            creds.validate(),
            Err(TransportError::InvalidRelayCredentials(_))
        ));
    }

    #[test]
    fn test_empty_connection_data_and_key_rejected() {
        let no_data = RelayCredentials {
            connection_data: Vec::new(),
            ..test_credentials(relay_addr())
        };
        assert!(no_data.validate().is_err());

        let no_key = RelayCredentials {
            key: Vec::new(),
            ..test_credentials(relay_addr())
        };
        assert!(no_key.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let text = format!("{:?}", test_credentials(relay_addr()));
        assert!(text.contains("<redacted>"));
        assert!(!text.contains("171"));
    }
}
