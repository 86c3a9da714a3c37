//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol::{BindFailurePolicy, ClientProtocol, Protocol, ProtocolSet};

const APP_NAME: &str = "polyport";

/// Top-level transport configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Protocol selection and peer limits.
    pub network: NetworkConfig,
    /// Raw backend tuning parameters.
    pub tuning: TuningConfig,
    /// Encryption switch and certificate material.
    pub security: SecurityConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Protocol selection, addressing and peer limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Protocol used when running as a client.
    pub client_protocol: ClientProtocol,
    /// Protocols a server listens on. Must not be empty for a server run.
    pub server_protocols: ProtocolSet,
    /// Server address a client connects to.
    pub server_address: String,
    /// First server port. Each enabled protocol takes the next port in canonical order.
    pub base_port: u16,
    /// Maximum number of simultaneously connected peers (server only).
    pub max_peers: u32,
    /// What to do when one of several server backends fails to bind.
    pub bind_failure: BindFailurePolicy,
    /// Tick rate driving `poll_events` (Hz).
    pub tick_rate: u32,
}

/// Raw backend tuning parameters, handed to every driver unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TuningConfig {
    /// Delay between connection attempts, in milliseconds.
    pub connect_timeout_ms: u32,
    /// Connection attempts before a connect is reported as failed.
    pub max_connect_attempts: u32,
    /// Receive silence after which a connection is considered lost, in milliseconds.
    pub disconnect_timeout_ms: u32,
    /// Send silence after which a heartbeat is emitted, in milliseconds.
    pub heartbeat_timeout_ms: u32,
    /// Socket receive buffer size in bytes (None = system default).
    pub socket_recv_buffer_size: Option<usize>,
    /// Socket send buffer size in bytes (None = system default).
    pub socket_send_buffer_size: Option<usize>,
}

/// Encryption switch and the credentials each role needs when it is on.
///
/// Servers need `certificate_pem` and `private_key_pem`; clients need
/// `server_name` and may pin a `ca_certificate_pem`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Whether backends must run their secure variant.
    pub encryption: bool,
    /// PEM certificate chain presented by a server.
    pub certificate_pem: String,
    /// PEM private key matching `certificate_pem`.
    pub private_key_pem: String,
    /// Common name a client expects the server certificate to carry.
    pub server_name: String,
    /// PEM CA certificate a client validates the server against (empty = platform roots).
    pub ca_certificate_pem: String,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            client_protocol: ClientProtocol::Auto,
            server_protocols: ProtocolSet::only(Protocol::Udp),
            server_address: "127.0.0.1".to_string(),
            base_port: 7777,
            max_peers: 32,
            bind_failure: BindFailurePolicy::Skip,
            tick_rate: 30,
        }
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1000,
            max_connect_attempts: 60,
            disconnect_timeout_ms: 30_000,
            heartbeat_timeout_ms: 500,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Default directory holding `config.ron`: `<os config dir>/polyport`.
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|base| base.join(APP_NAME))
        .ok_or(ConfigError::NoConfigDir)
}

// --- Load / Save / Reload ---

const FILE_NAME: &str = "config.ron";

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl Config {
    /// Read `config.ron` from `config_dir`. On first run the defaults are
    /// written there and returned.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(FILE_NAME);
        if !path.exists() {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Wrote default config to {}", path.display());
            return Ok(config);
        }

        let config = read_file(&path)?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Write this config to `config_dir/config.ron`, creating the directory.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let path = config_dir.join(FILE_NAME);
        let write_err = |source: std::io::Error| ConfigError::Write {
            path: path.clone(),
            source,
        };

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .enumerate_arrays(false);
        let text = ron::ser::to_string_pretty(self, pretty)?;

        std::fs::create_dir_all(config_dir).map_err(write_err)?;
        std::fs::write(&path, text).map_err(write_err)
    }

    /// Re-read the file. `None` means it still matches `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = read_file(&config_dir.join(FILE_NAME))?;
        if fresh == *self {
            return Ok(None);
        }
        log::info!("Config changed on disk");
        Ok(Some(fresh))
    }
}
