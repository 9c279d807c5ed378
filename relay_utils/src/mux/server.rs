//! Server end of the tunnel.

use super::auth::authenticate_server;
use super::error::{TunnelError, TunnelResult};
use super::frame::FrameReader;
use super::session::{Session, SynRequest};
use crate::transport::{Conn, Dialer, Listener};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_GRACE: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const SYN_QUEUE: usize = 64;

/// Accepts tunnel clients, authenticates them against a credential table and
/// relays the streams they open through `outbound`.
pub struct Service {
    credentials: Arc<HashMap<String, String>>,
    outbound: Arc<dyn Dialer>,
}

impl Service {
    pub fn new(auth: HashMap<String, String>, outbound: Box<dyn Dialer>) -> TunnelResult<Service> {
        if auth.is_empty() {
            return Err(TunnelError::Config("no tunnel credentials configured".into()));
        }
        Ok(Service {
            credentials: Arc::new(auth),
            outbound: Arc::from(outbound),
        })
    }

    /// Runs the accept loop until `shutdown` is cancelled.
    ///
    /// Failures of individual connections are logged and never end the loop.
    /// On shutdown every session is closed and the connection tasks get a
    /// bounded grace period to finish.
    pub async fn serve<L: Listener>(&self, mut listener: L, shutdown: CancellationToken) -> TunnelResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Tunnel server listening on {}", addr);
        }

        let tracker = TaskTracker::new();
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((conn, peer)) => {
                    debug!(peer = %peer, "Accepted tunnel connection");
                    let credentials = self.credentials.clone();
                    let outbound = self.outbound.clone();
                    let shutdown = shutdown.clone();
                    let streams = tracker.clone();
                    tracker.spawn(async move {
                        if let Err(e) =
                            handle_connection(conn, peer, credentials, outbound, streams, shutdown).await
                        {
                            warn!(peer = %peer, error = %e, "Tunnel connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept tunnel connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        tracker.close();
        info!(connections = tracker.len(), "Tunnel server draining");
        if tokio::time::timeout(DRAIN_GRACE, tracker.wait()).await.is_err() {
            warn!(remaining = tracker.len(), "Drain grace period elapsed");
        }
        Ok(())
    }
}

async fn handle_connection(
    conn: Conn,
    peer: SocketAddr,
    credentials: Arc<HashMap<String, String>>,
    outbound: Arc<dyn Dialer>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) -> TunnelResult<()> {
    let (rd, mut wr) = tokio::io::split(conn);
    let mut reader = FrameReader::new(rd);

    let principal = tokio::time::timeout(
        AUTH_TIMEOUT,
        authenticate_server(&mut reader, &mut wr, &credentials),
    )
    .await
    .map_err(|_| TunnelError::Timeout("authentication".into()))??;

    let (syn_tx, mut syn_rx) = mpsc::channel(SYN_QUEUE);
    let session = Session::spawn(
        principal.session_id,
        peer.to_string(),
        reader,
        wr,
        Some(syn_tx),
    );

    loop {
        tokio::select! {
            request = syn_rx.recv() => match request {
                Some(request) => {
                    tracker.spawn(open_outbound(session.clone(), outbound.clone(), request));
                }
                None => break,
            },
            _ = shutdown.cancelled() => {
                session.close();
                break;
            }
        }
    }

    info!(
        username = %principal.username,
        session_id = %session.id(),
        "Tunnel session closed"
    );
    Ok(())
}

async fn open_outbound(session: Arc<Session>, outbound: Arc<dyn Dialer>, request: SynRequest) {
    info!(session_id = %session.id(), dest = %request.target, "Connecting");
    match outbound.dial(&request.target).await {
        Ok(conn) => {
            if let Err(e) = session.accept_stream(request, conn).await {
                debug!(error = %e, "Stream accepted on a closing session");
            }
        }
        Err(e) => {
            warn!(dest = %request.target, error = %e, "Outbound dial failed");
            let _ = session.refuse_stream(&request, &e.to_string()).await;
        }
    }
}
