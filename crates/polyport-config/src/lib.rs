//! Configuration system for polyport.
//!
//! Declares which transport backends a run uses, how they are tuned, and which
//! certificate material secures them. Settings persist to disk as RON files,
//! accept CLI overrides via clap, and support hot-reload detection.

mod cli;
mod config;
mod error;
mod protocol;

pub use cli::CliArgs;
pub use config::{
    Config, DebugConfig, NetworkConfig, SecurityConfig, TuningConfig, default_config_dir,
};
pub use error::ConfigError;
pub use protocol::{BindFailurePolicy, ClientProtocol, ParseProtocolError, Protocol, ProtocolSet};
