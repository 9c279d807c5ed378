use crate::transport::{Conn, Dialer, Listener, TransportError};
use async_trait::async_trait;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// --- TCP Dialer ---

/// Plain outbound TCP dialer, the bottom of every dialer chain.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new() -> Self {
        TcpDialer {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(connect_timeout: Duration) -> Self {
        TcpDialer { connect_timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<Conn, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect to {addr}")))?
            .map_err(|e| TransportError::Connection(format!("connect to {addr}: {e}")))?;
        stream.set_nodelay(true)?;
        debug!(remote = %addr, "TCP connection established");
        Ok(Box::new(stream))
    }
}

// --- TCP Listener ---

/// Raw TCP listener handing out unwrapped connections.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Binds a listening socket on `addr`. An empty host (`":8080"`) binds
    /// every interface.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(listen_addr(addr).as_ref())
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        info!(listen = %addr, "TCP listener bound");
        Ok(TcpAcceptor { listener })
    }
}

fn listen_addr(addr: &str) -> Cow<'_, str> {
    match addr.strip_prefix(':') {
        Some(port) => Cow::Owned(format!("0.0.0.0:{port}")),
        None => Cow::Borrowed(addr),
    }
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&mut self) -> Result<(Conn, SocketAddr), TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_dial_and_accept() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = acceptor.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let mut conn = TcpDialer::new().dial(&addr.to_string()).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[test]
    fn test_listen_addr_fills_empty_host() {
        assert_eq!(listen_addr(":5233"), "0.0.0.0:5233");
        assert_eq!(listen_addr("127.0.0.1:80"), "127.0.0.1:80");
        assert_eq!(listen_addr("[::1]:80"), "[::1]:80");
    }

    #[tokio::test]
    async fn test_bind_port_only_address() {
        let mut acceptor = TcpAcceptor::bind(":0").await.unwrap();
        let port = acceptor.local_addr().unwrap().port();
        assert_ne!(port, 0);

        let client = tokio::spawn(async move {
            TcpDialer::new()
                .dial(&format!("127.0.0.1:{port}"))
                .await
                .unwrap()
        });
        acceptor.accept().await.unwrap();
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_in_use_address_fails() {
        let first = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap().to_string();

        match TcpAcceptor::bind(&addr).await {
            Err(TransportError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
            other => panic!("expected bind error, got {:?}", other.map(|_| ())),
        }
    }
}
