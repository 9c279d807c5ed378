use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("Underlying transport specific error: {0}")]
    Protocol(String),
}

/// Any bidirectional byte stream a dialer or listener can hand out.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// An established connection, erased to its byte-stream capability.
pub type Conn = Box<dyn AsyncStream>;

/// Capability to open an outbound connection to an address.
///
/// The address format is `host:port`; hosts may be names or IP literals.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Opens a connection to `addr`.
    async fn dial(&self, addr: &str) -> Result<Conn, TransportError>;
}

/// Trait for a transport listener, capable of accepting incoming connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accepts a new incoming connection.
    /// This method will block until a new connection is established or an error occurs.
    async fn accept(&mut self) -> Result<(Conn, SocketAddr), TransportError>;

    /// Returns the local socket address this listener is bound to.
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;
}

#[async_trait]
impl<D: Dialer + ?Sized> Dialer for Arc<D> {
    async fn dial(&self, addr: &str) -> Result<Conn, TransportError> {
        (**self).dial(addr).await
    }
}

#[async_trait]
impl<D: Dialer + ?Sized> Dialer for Box<D> {
    async fn dial(&self, addr: &str) -> Result<Conn, TransportError> {
        (**self).dial(addr).await
    }
}

#[async_trait]
impl<L: Listener + ?Sized> Listener for Box<L> {
    async fn accept(&mut self) -> Result<(Conn, SocketAddr), TransportError> {
        (**self).accept().await
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        (**self).local_addr()
    }
}

/// Splits `host:port` into its parts, accepting bracketed IPv6 hosts.
pub fn split_host_port(addr: &str) -> Result<(&str, u16), TransportError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| TransportError::Connection(format!("missing port in address {addr}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(TransportError::Connection(format!(
            "missing host in address {addr}"
        )));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| TransportError::Connection(format!("invalid port in address {addr}")))?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_host_port_handles_names_and_literals() {
        assert_eq!(split_host_port("example.com:80").unwrap(), ("example.com", 80));
        assert_eq!(split_host_port("10.1.2.3:443").unwrap(), ("10.1.2.3", 443));
        assert_eq!(split_host_port("[::1]:8080").unwrap(), ("::1", 8080));
    }

    #[test]
    fn split_host_port_rejects_garbage() {
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port(":80").is_err());
        assert!(split_host_port("example.com:http").is_err());
    }
}
