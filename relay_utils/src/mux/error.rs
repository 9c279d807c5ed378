use std::io;
use thiserror::Error;

use super::frame::FrameError;
use crate::transport::TransportError;

pub type TunnelResult<T> = Result<T, TunnelError>;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    /// Invalid setup, such as an empty credential table
    #[error("Configuration error: {0}")]
    Config(String),

    /// The peer broke the frame or auth sequence
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The server could not reach the requested target
    #[error("Remote dial to {addr} failed: {reason}")]
    RemoteDial { addr: String, reason: String },

    #[error("Tunnel session closed")]
    Closed,

    #[error("Timed out during {0}")]
    Timeout(String),
}

// Tunnel dialers sit inside plain dialer chains
impl From<TunnelError> for TransportError {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::Transport(inner) => inner,
            TunnelError::Io(inner) => TransportError::Io(inner),
            TunnelError::Timeout(what) => TransportError::Timeout(what),
            other => TransportError::Connection(other.to_string()),
        }
    }
}
