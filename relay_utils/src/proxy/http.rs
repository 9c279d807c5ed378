//! HTTP proxy server
//!
//! Three request shapes are understood:
//!
//! - `CONNECT host:port` opens a raw tunnel through the dialer;
//! - absolute-form requests (`GET http://host/path`) are rewritten to
//!   origin-form and forwarded through the dialer;
//! - origin-form requests (`GET /path`) are answered by the admin router.

use super::{AdminRouter, ProxyError};
use crate::tcp::TcpAcceptor;
use crate::transport::{Conn, Dialer, Listener, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const DRAIN_GRACE: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_HTTP_PORT: u16 = 80;

/// HTTP proxy server
pub struct HttpProxy {
    listener: TcpAcceptor,
    dialer: Arc<dyn Dialer>,
    router: Arc<AdminRouter>,
}

struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl HttpProxy {
    /// Binds the proxy listener on `addr`.
    pub async fn bind(addr: &str, dialer: Box<dyn Dialer>, router: AdminRouter) -> Result<Self, ProxyError> {
        let listener = TcpAcceptor::bind(addr).await?;
        Ok(Self {
            listener,
            dialer: Arc::from(dialer),
            router: Arc::new(router),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener.local_addr()
    }

    /// Accepts clients until `shutdown` is cancelled, then drains.
    pub async fn serve(mut self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        info!("HTTP proxy listening on {}", self.listener.local_addr()?);

        let tracker = TaskTracker::new();
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((conn, peer)) => {
                    let dialer = self.dialer.clone();
                    let router = self.router.clone();
                    let shutdown = shutdown.clone();
                    tracker.spawn(async move {
                        tokio::select! {
                            result = handle_client(conn, dialer, router) => {
                                if let Err(e) = result {
                                    warn!(peer = %peer, error = %e, "HTTP proxy connection error");
                                }
                            }
                            _ = shutdown.cancelled() => {
                                debug!(peer = %peer, "Dropping proxy connection on shutdown");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept proxy connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        tracker.close();
        if tokio::time::timeout(DRAIN_GRACE, tracker.wait()).await.is_err() {
            warn!(remaining = tracker.len(), "Drain grace period elapsed");
        }
        Ok(())
    }
}

async fn handle_client(
    conn: Conn,
    dialer: Arc<dyn Dialer>,
    router: Arc<AdminRouter>,
) -> Result<(), ProxyError> {
    let mut reader = BufReader::new(conn);
    let head = match read_head(&mut reader).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(ProxyError::HeadTooLarge(limit)) => {
            respond_status(reader.get_mut(), "431 Request Header Fields Too Large").await?;
            return Err(ProxyError::HeadTooLarge(limit));
        }
        Err(e) => {
            respond_status(reader.get_mut(), "400 Bad Request").await?;
            return Err(e);
        }
    };
    debug!(method = %head.method, dest = %head.target, "Proxy request");

    if head.method.eq_ignore_ascii_case("CONNECT") {
        let mut upstream = match dialer.dial(&head.target).await {
            Ok(upstream) => upstream,
            Err(source) => {
                respond_status(reader.get_mut(), "502 Bad Gateway").await?;
                return Err(ProxyError::Upstream {
                    target: head.target,
                    source,
                });
            }
        };
        let early = reader.buffer().to_vec();
        let mut client = reader.into_inner();
        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        upstream.write_all(&early).await?;
        relay(&mut client, &mut upstream).await;
        return Ok(());
    }

    if let Some(rest) = head.target.strip_prefix("http://") {
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            respond_status(reader.get_mut(), "400 Bad Request").await?;
            return Err(ProxyError::BadRequest(format!("no host in {}", head.target)));
        }
        let dial_addr = if has_port(authority) {
            authority.to_string()
        } else {
            format!("{}:{}", authority, DEFAULT_HTTP_PORT)
        };

        let mut upstream = match dialer.dial(&dial_addr).await {
            Ok(upstream) => upstream,
            Err(source) => {
                respond_status(reader.get_mut(), "502 Bad Gateway").await?;
                return Err(ProxyError::Upstream {
                    target: dial_addr,
                    source,
                });
            }
        };

        let rewritten = rewrite_head(&head, authority, path);
        upstream.write_all(rewritten.as_bytes()).await?;
        let early = reader.buffer().to_vec();
        let mut client = reader.into_inner();
        upstream.write_all(&early).await?;
        relay(&mut client, &mut upstream).await;
        return Ok(());
    }

    if head.target.starts_with('/') {
        match router.handle(&head.target) {
            Some(body) => {
                let body = serde_json::to_vec_pretty(&body)
                    .map_err(|e| ProxyError::BadRequest(e.to_string()))?;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let client = reader.get_mut();
                client.write_all(response.as_bytes()).await?;
                client.write_all(&body).await?;
                client.shutdown().await?;
            }
            None => respond_status(reader.get_mut(), "404 Not Found").await?,
        }
        return Ok(());
    }

    respond_status(reader.get_mut(), "400 Bad Request").await?;
    Err(ProxyError::BadRequest(format!(
        "unsupported request target {}",
        head.target
    )))
}

/// Reads one line without letting the whole head grow past `MAX_HEAD_BYTES`.
async fn read_bounded_line(
    reader: &mut BufReader<Conn>,
    line: &mut String,
    consumed: usize,
) -> Result<usize, ProxyError> {
    let budget = MAX_HEAD_BYTES.saturating_sub(consumed);
    if budget == 0 {
        return Err(ProxyError::HeadTooLarge(MAX_HEAD_BYTES));
    }
    let n = (&mut *reader).take(budget as u64).read_line(line).await?;
    if n == budget && !line.ends_with('\n') {
        return Err(ProxyError::HeadTooLarge(MAX_HEAD_BYTES));
    }
    Ok(n)
}

async fn read_head(reader: &mut BufReader<Conn>) -> Result<Option<RequestHead>, ProxyError> {
    let mut line = String::new();
    let mut consumed = read_bounded_line(reader, &mut line, 0).await?;
    if consumed == 0 {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::BadRequest(format!(
            "invalid request line {:?}",
            line.trim_end()
        )));
    };
    let mut head = RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers: Vec::new(),
    };

    loop {
        line.clear();
        let n = read_bounded_line(reader, &mut line, consumed).await?;
        consumed += n;
        let trimmed = line.trim_end();
        if n == 0 || trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            head.headers
                .push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(Some(head))
}

/// Origin-form request head with the proxy's hop-by-hop headers removed.
fn rewrite_head(head: &RequestHead, authority: &str, path: &str) -> String {
    let mut out = format!("{} {} {}\r\n", head.method, path, head.version);
    let mut has_host = false;
    for (name, value) in &head.headers {
        let lower = name.to_ascii_lowercase();
        if lower.starts_with("proxy-") || lower == "connection" || lower == "keep-alive" {
            continue;
        }
        has_host |= lower == "host";
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !has_host {
        out.push_str(&format!("Host: {}\r\n", authority));
    }
    out.push_str("Connection: close\r\n\r\n");
    out
}

fn has_port(authority: &str) -> bool {
    match authority.rsplit_once(':') {
        Some((host, port)) => !host.ends_with(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}

async fn respond_status<W: AsyncWrite + Unpin>(client: &mut W, status: &str) -> Result<(), ProxyError> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status
    );
    client.write_all(response.as_bytes()).await?;
    client.shutdown().await?;
    Ok(())
}

async fn relay(client: &mut Conn, upstream: &mut Conn) {
    match tokio::io::copy_bidirectional(client, upstream).await {
        Ok((sent, received)) => debug!(sent, received, "Proxy relay finished"),
        Err(e) => debug!(error = %e, "Proxy relay ended"),
    }
}
