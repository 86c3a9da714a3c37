//! Secure channel configuration.
//!
//! Turns the PEM material in [`SecurityConfig`] into DER parameters for the
//! role being run. Everything here happens before a single driver is created,
//! so a bad credential never leaves a half-bound transport behind.

use std::fmt;
use std::io::Cursor;

use polyport_config::SecurityConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::TransportError;
use crate::selector::Role;

/// Security parameters handed to every backend of a run.
pub enum SecurityParams {
    /// Encryption disabled.
    Plain,
    /// Server side of an encrypted run.
    Server {
        /// Certificate chain, leaf first.
        chain: Vec<CertificateDer<'static>>,
        /// Private key for the leaf certificate.
        key: PrivateKeyDer<'static>,
    },
    /// Client side of an encrypted run.
    Client {
        /// Name the server certificate must carry.
        server_name: String,
        /// Pinned CA certificates, if any.
        ca: Option<Vec<CertificateDer<'static>>>,
    },
}

impl SecurityParams {
    /// Whether backends must run their secure variant.
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, SecurityParams::Plain)
    }
}

impl fmt::Debug for SecurityParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityParams::Plain => f.write_str("Plain"),
            SecurityParams::Server { chain, .. } => f
                .debug_struct("Server")
                .field("chain_len", &chain.len())
                .field("key", &"<redacted>")
                .finish(),
            SecurityParams::Client { server_name, ca } => f
                .debug_struct("Client")
                .field("server_name", server_name)
                .field("ca_len", &ca.as_ref().map(Vec::len))
                .finish(),
        }
    }
}

/// Validate and parse the credentials the role needs.
///
/// Fails fast on empty fields before attempting to parse anything.
pub fn configure_security(
    config: &SecurityConfig,
    role: Role,
) -> Result<SecurityParams, TransportError> {
    if !config.encryption {
        return Ok(SecurityParams::Plain);
    }

    match role {
        Role::Server => {
            require(role, "certificate", &config.certificate_pem)?;
            require(role, "private key", &config.private_key_pem)?;
            let chain = parse_certificates("certificate", &config.certificate_pem)?;
            let key = parse_private_key(&config.private_key_pem)?;
            tracing::debug!(certificates = chain.len(), "Server credentials parsed");
            Ok(SecurityParams::Server { chain, key })
        }
        Role::Client => {
            require(role, "server name", &config.server_name)?;
            let ca = if config.ca_certificate_pem.trim().is_empty() {
                None
            } else {
                Some(parse_certificates(
                    "CA certificate",
                    &config.ca_certificate_pem,
                )?)
            };
            Ok(SecurityParams::Client {
                server_name: config.server_name.trim().to_string(),
                ca,
            })
        }
    }
}

fn require(role: Role, field: &'static str, value: &str) -> Result<(), TransportError> {
    if value.trim().is_empty() {
        return Err(TransportError::MissingCredential {
            role: role.name(),
            field,
        });
    }
    Ok(())
}

fn parse_certificates(
    field: &'static str,
    pem: &str,
) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut reader = Cursor::new(pem.as_bytes());
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::MalformedCredential {
            field,
            reason: e.to_string(),
        })?;
    if chain.is_empty() {
        return Err(TransportError::MalformedCredential {
            field,
            reason: "no PEM certificate found".to_string(),
        });
    }
    Ok(chain)
}

fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut reader = Cursor::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::MalformedCredential {
            field: "private key",
            reason: e.to_string(),
        })?
        .ok_or_else(|| TransportError::MalformedCredential {
            field: "private key",
            reason: "no PEM private key found".to_string(),
        })
}
