//! HTTP proxy front end and its administrative routes.

pub mod admin;
pub mod http;

pub use admin::AdminRouter;
pub use http::HttpProxy;

use crate::transport::TransportError;
use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Upstream {target} unreachable: {source}")]
    Upstream {
        target: String,
        #[source]
        source: TransportError,
    },
}
