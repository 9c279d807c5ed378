//! Shared building blocks for the relay.
//!
//! This crate provides everything both relay modes are assembled from:
//! configuration, logging, raw and encrypted transports, the multiplexed
//! tunnel, the split-tunnel route filter, resolver bootstrap and the HTTP
//! proxy front end.

pub mod config;
pub mod crypto;
pub mod dns;
pub mod filter;
pub mod logging;
pub mod mux;
pub mod proxy;
pub mod tcp;
pub mod transport;

// Re-export commonly used types for convenience
pub use config::{Config, ConfigError, Mode};
pub use transport::{Conn, Dialer, Listener, TransportError};
