//! # wadb Client Library
//!
//! Async client for wireless debugging daemons: connection establishment
//! with in-place TLS upgrade and RSA authentication, one-shot shell
//! command exchanges, a caching connection lifecycle manager, and the
//! pairing flow that makes a device trust this client's key.
//!
//! ## Modules
//!
//! - [`connection`]: Handshake state machine and shell exchange
//! - [`manager`]: Connection caching, sharing, and idle teardown
//! - [`pairing`]: Client side of the pairing exchange
//! - [`config`]: TOML configuration

pub mod config;
pub mod connection;
pub mod manager;
pub mod pairing;

pub use config::{default_config_path, Config, ConfigError};
pub use connection::Connection;
pub use manager::ConnectionManager;
pub use pairing::{PairingClient, PairingSession};
