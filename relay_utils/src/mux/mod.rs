//! Multiplexed, authenticated tunnel.
//!
//! One long-lived connection from the client carries any number of virtual
//! connections (streams). The client opens a stream with a `Syn` naming the
//! target address; the server dials it and relays bytes until either side
//! finishes.

pub mod auth;
pub mod client;
pub mod error;
pub mod frame;
pub mod server;
pub mod session;

pub use client::{TunnelDialer, TunnelStatus};
pub use error::{TunnelError, TunnelResult};
pub use server::Service;
pub use session::{SessionInfo, StreamInfo};
