//! Client end of the tunnel: a dialer whose connections are virtual streams.

use super::auth::authenticate_client;
use super::error::{TunnelError, TunnelResult};
use super::frame::FrameReader;
use super::session::{Session, SessionInfo, StreamInfo};
use crate::proxy::AdminRouter;
use crate::transport::{Conn, Dialer, TransportError};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Reported by `/tunnel/status`.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub server: String,
    pub username: String,
    pub sessions_established: u64,
    pub session: SessionInfo,
}

/// Dialer that opens every connection as a stream of one shared, authenticated
/// tunnel session.
///
/// The session is established by [`TunnelDialer::connect`]. If it later dies,
/// the next dial establishes a fresh one through the same inner dialer.
pub struct TunnelDialer {
    inner: Box<dyn Dialer>,
    server: String,
    username: String,
    password: String,
    current: Mutex<Arc<Session>>,
    reconnect: tokio::sync::Mutex<()>,
    established: AtomicU64,
}

impl TunnelDialer {
    /// Dials `server` through `inner` and authenticates.
    pub async fn connect(
        inner: Box<dyn Dialer>,
        server: &str,
        username: &str,
        password: &str,
    ) -> TunnelResult<TunnelDialer> {
        let session = establish(inner.as_ref(), server, username, password).await?;
        Ok(TunnelDialer {
            inner,
            server: server.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            current: Mutex::new(session),
            reconnect: tokio::sync::Mutex::new(()),
            established: AtomicU64::new(1),
        })
    }

    pub fn status(&self) -> TunnelStatus {
        TunnelStatus {
            server: self.server.clone(),
            username: self.username.clone(),
            sessions_established: self.established.load(Ordering::Relaxed),
            session: self.current().info(),
        }
    }

    pub fn streams(&self) -> Vec<StreamInfo> {
        self.current().streams()
    }

    /// Drops the current session and every stream on it. Returns its id.
    pub fn cutoff(&self) -> String {
        let session = self.current();
        info!(session_id = %session.id(), "Cutting off tunnel session");
        session.close();
        session.id().to_string()
    }

    /// Mounts the tunnel's administrative endpoints.
    pub fn register(self: &Arc<Self>, router: &mut AdminRouter) {
        let tunnel = self.clone();
        router.route("/tunnel/status", move || to_json(&tunnel.status()));
        let tunnel = self.clone();
        router.route("/tunnel/streams", move || to_json(&tunnel.streams()));
        let tunnel = self.clone();
        router.route("/tunnel/cutoff", move || json!({ "closed": tunnel.cutoff() }));
    }

    fn current(&self) -> Arc<Session> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn live_session(&self) -> TunnelResult<Arc<Session>> {
        let session = self.current();
        if !session.is_closed() {
            return Ok(session);
        }

        let _guard = self.reconnect.lock().await;
        // Another dial may have reconnected while we waited
        let session = self.current();
        if !session.is_closed() {
            return Ok(session);
        }

        warn!(server = %self.server, "Tunnel session lost, reconnecting");
        let fresh = establish(
            self.inner.as_ref(),
            &self.server,
            &self.username,
            &self.password,
        )
        .await?;
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = fresh.clone();
        self.established.fetch_add(1, Ordering::Relaxed);
        Ok(fresh)
    }
}

#[async_trait]
impl Dialer for TunnelDialer {
    async fn dial(&self, addr: &str) -> Result<Conn, TransportError> {
        let session = self.live_session().await?;
        let conn = session.open_stream(addr).await?;
        Ok(conn)
    }
}

async fn establish(
    inner: &dyn Dialer,
    server: &str,
    username: &str,
    password: &str,
) -> TunnelResult<Arc<Session>> {
    debug!(server = %server, "Dialing tunnel server");
    let conn = inner.dial(server).await?;
    let (rd, mut wr) = tokio::io::split(conn);
    let mut reader = FrameReader::new(rd);

    let session_id = tokio::time::timeout(
        AUTH_TIMEOUT,
        authenticate_client(&mut reader, &mut wr, username, password),
    )
    .await
    .map_err(|_| TunnelError::Timeout("authentication".into()))??;

    let session = Session::spawn(session_id, server.to_string(), reader, wr, None);
    tokio::spawn(keepalive(session.clone()));
    info!(server = %server, session_id = %session.id(), "Tunnel established");
    Ok(session)
}

async fn keepalive(session: Arc<Session>) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if session.ping().await.is_err() {
                    break;
                }
            }
            _ = session.closed() => break,
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
