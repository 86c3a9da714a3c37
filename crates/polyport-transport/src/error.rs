//! Error types for the transport and its drivers.

use polyport_config::Protocol;

/// Errors surfaced by [`Transport`](crate::Transport) operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    // --- Configuration ---
    /// A client run was requested with `ClientProtocol::None`.
    #[error("no client protocol selected")]
    NoClientProtocol,

    /// A server run was requested with an empty protocol set.
    #[error("no server protocols enabled")]
    EmptyServerProtocols,

    /// Encryption is on but a credential the role needs is empty.
    #[error("{role} requires a {field} when encryption is enabled")]
    MissingCredential {
        /// Role that needs the credential.
        role: &'static str,
        /// Name of the missing field.
        field: &'static str,
    },

    /// A credential is present but cannot be parsed.
    #[error("malformed {field}: {reason}")]
    MalformedCredential {
        /// Name of the offending field.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// A server backend's port would lie past 65535.
    #[error("{protocol} has no port: offset from base port {base_port} exceeds 65535")]
    PortOutOfRange {
        /// Protocol that could not be given a port.
        protocol: Protocol,
        /// Configured base port.
        base_port: u16,
    },

    /// A relay protocol was planned without relay credentials.
    #[error("{0} needs relay credentials")]
    MissingRelayCredentials(Protocol),

    /// Relay credentials were supplied but are unusable.
    #[error("invalid relay credentials: {0}")]
    InvalidRelayCredentials(&'static str),

    /// The driver factory cannot build a backend for this protocol on this platform.
    #[error("no driver available for {0}")]
    UnsupportedInterface(Protocol),

    /// The driver factory cannot provide a secure variant of this protocol.
    #[error("{protocol} cannot run encrypted with this driver factory")]
    EncryptionUnsupported {
        /// Protocol that was asked to run encrypted.
        protocol: Protocol,
    },

    // --- Lifecycle ---
    /// `run` was called while a run is active.
    #[error("transport is already running")]
    AlreadyRunning,

    /// An operation needs an active run.
    #[error("transport is not running")]
    NotRunning,

    /// The operation is not valid for the role of the active run.
    #[error("operation not valid for a {0} run")]
    WrongRole(&'static str),

    // --- Bind ---
    /// A server backend failed to bind its port.
    #[error("failed to bind {protocol} on port {port}")]
    BindFailed {
        /// Protocol of the backend.
        protocol: Protocol,
        /// Port it tried to bind.
        port: u16,
        /// Underlying driver error.
        #[source]
        source: DriverError,
    },

    /// Every server backend failed to bind.
    #[error("no server backend could be bound")]
    NoBackendsBound,

    // --- Connect ---
    /// A client already has a connection to its server, or an attempt is in progress.
    #[error("client is already connected or connecting")]
    AlreadyConnected,

    /// The connection request exceeds [`MAX_CONNECT_REQUEST_SIZE`](crate::MAX_CONNECT_REQUEST_SIZE).
    #[error("connection request of {size} bytes exceeds the {max} byte limit")]
    RequestTooLarge {
        /// Size of the request.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// The server address could not be resolved.
    #[error("invalid server address '{0}'")]
    InvalidAddress(String),

    /// No running driver serves the requested protocol.
    #[error("no running driver for {0}")]
    NoDriverForProtocol(Protocol),

    /// A driver call failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Errors returned by a [`Driver`](crate::Driver).
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] postcard::Error),

    /// The connection id does not name a live connection.
    #[error("invalid connection id")]
    InvalidConnection,

    /// The connection exists but has not completed its handshake.
    #[error("connection is not established")]
    NotConnected,

    /// The driver has no bound endpoint.
    #[error("driver is not bound")]
    NotBound,

    /// The payload does not fit in one datagram.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Size of the payload.
        size: usize,
        /// Largest payload the driver accepts.
        max: usize,
    },
}
