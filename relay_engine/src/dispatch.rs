//! Mode selection.

use crate::assemble::{AssembleError, run_http, run_server};
use relay_utils::config::{Config, Mode};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How a dispatch finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `stop` mode: nothing was opened
    Stopped,
    /// A serve loop ran until shutdown
    Served,
    /// The mode name was not recognised and nothing was opened
    Unsupported(String),
}

pub async fn dispatch(config: &Config, shutdown: CancellationToken) -> Result<Outcome, AssembleError> {
    match &config.mode {
        Mode::Stop => {
            info!("stop mode start.");
            info!("server stopped in stop mode");
            Ok(Outcome::Stopped)
        }
        Mode::Server => {
            info!("server mode start.");
            run_server(config, shutdown).await?;
            Ok(Outcome::Served)
        }
        Mode::Http => {
            info!("http mode start.");
            run_http(config, shutdown).await?;
            Ok(Outcome::Served)
        }
        Mode::Unsupported(name) => {
            warn!(mode = %name, "Unsupported mode, nothing to run");
            Ok(Outcome::Unsupported(name.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_utils::transport::TransportError;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    async fn free_addr() -> SocketAddr {
        TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap()
    }

    async fn wait_listening(addr: SocketAddr) {
        for _ in 0..100 {
            if TcpStream::connect(addr).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("nothing listening on {addr}");
    }

    fn config(value: serde_json::Value) -> Config {
        Config::from_json_str(&value.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_stop_mode_opens_nothing() {
        let cfg = config(json!({ "Mode": "stop" }));
        let outcome = dispatch(&cfg, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, Outcome::Stopped);
    }

    #[tokio::test]
    async fn test_unknown_mode_is_inert() {
        let cfg = config(json!({ "Mode": "socks5", "Listen": "127.0.0.1:1" }));
        let outcome = dispatch(&cfg, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, Outcome::Unsupported("socks5".into()));
    }

    #[tokio::test]
    async fn test_bind_failure_short_circuits() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap();
        let cfg = config(json!({
            "Mode": "server",
            "Listen": addr.to_string(),
            "Cipher": "aes",
            "Key": KEY,
            "Auth": { "alice": "secret" }
        }));

        let err = dispatch(&cfg, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AssembleError::Transport(TransportError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_bad_cipher_fails_before_serving() {
        let cfg = config(json!({
            "Mode": "server",
            "Listen": "127.0.0.1:0",
            "Cipher": "rc4",
            "Key": "00",
            "Auth": { "alice": "secret" }
        }));

        let err = dispatch(&cfg, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AssembleError::Transport(TransportError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_server_mode_stops_on_cancel() {
        let cfg = config(json!({
            "Mode": "server",
            "Listen": "127.0.0.1:0",
            "Cipher": "aes",
            "Key": KEY,
            "Auth": { "alice": "secret" }
        }));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let outcome = dispatch(&cfg, shutdown).await.unwrap();
        assert_eq!(outcome, Outcome::Served);
    }

    #[tokio::test]
    async fn test_http_mode_serves_proxy_and_admin_routes() {
        let dir = tempfile::tempdir().unwrap();
        let resolv = dir.path().join("resolv.conf");
        std::fs::write(&resolv, "nameserver 127.0.0.1\n").unwrap();
        let blackfile = dir.path().join("black.list");
        std::fs::write(&blackfile, "10.0.0.0/8\n").unwrap();

        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = echo.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });

        let shutdown = CancellationToken::new();
        let server_addr = free_addr().await;
        let server_cfg = config(json!({
            "Mode": "server",
            "Listen": server_addr.to_string(),
            "Cipher": "aes",
            "Key": KEY,
            "Auth": { "alice": "secret" }
        }));
        let server_shutdown = shutdown.clone();
        let server = tokio::spawn(async move { dispatch(&server_cfg, server_shutdown).await });
        wait_listening(server_addr).await;

        let proxy_addr = free_addr().await;
        let http_cfg = config(json!({
            "Mode": "http",
            "Listen": proxy_addr.to_string(),
            "Server": server_addr.to_string(),
            "Cipher": "aes",
            "Key": KEY,
            "Username": "alice",
            "Password": "secret",
            "Blackfile": blackfile.to_string_lossy(),
            "ResolvConf": resolv.to_string_lossy()
        }));
        let http_shutdown = shutdown.clone();
        let http = tokio::spawn(async move { dispatch(&http_cfg, http_shutdown).await });
        wait_listening(proxy_addr).await;

        // Admin routes answer on the proxy listener
        let mut admin = TcpStream::connect(proxy_addr).await.unwrap();
        admin
            .write_all(b"GET /tunnel/status HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        admin.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"sessions_established\": 1"));

        // CONNECT travels through the tunnel to the echo server
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(format!("CONNECT {echo_addr} HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let established = b"HTTP/1.1 200 Connection Established\r\n\r\n";
        let mut head = vec![0u8; established.len()];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(head, established);
        client.write_all(b"through the proxy").await.unwrap();
        let mut buf = [0u8; 17];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the proxy");
        drop(client);

        shutdown.cancel();
        assert_eq!(http.await.unwrap().unwrap(), Outcome::Served);
        assert_eq!(server.await.unwrap().unwrap(), Outcome::Served);
    }

    #[tokio::test]
    async fn test_http_mode_with_unreachable_server_fails() {
        let dir = tempfile::tempdir().unwrap();
        let resolv = dir.path().join("resolv.conf");
        std::fs::write(&resolv, "nameserver 127.0.0.1\n").unwrap();
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();

        let cfg = config(json!({
            "Mode": "http",
            "Listen": "127.0.0.1:0",
            "Server": closed.to_string(),
            "Cipher": "aes",
            "Key": KEY,
            "Username": "alice",
            "Password": "secret",
            "ResolvConf": resolv.to_string_lossy()
        }));

        let err = dispatch(&cfg, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AssembleError::Tunnel(_)));
    }
}
