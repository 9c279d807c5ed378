//! One authenticated tunnel connection carrying many virtual connections.
//!
//! A session owns two background tasks: a writer draining the outbound frame
//! queue into the transport, and a reader dispatching inbound frames to
//! per-stream channels. Each open stream is relayed by its own task.
//!
//! Streams are flow controlled in frames: a sender holds `STREAM_WINDOW`
//! credits per stream, spends one per `Data` frame, and regains them through
//! `WindowUpdate` frames once the receiver has written the data locally. The
//! reader task therefore never waits on a single slow stream; a peer that
//! overruns the window gets the stream reset.

use super::error::{TunnelError, TunnelResult};
use super::frame::{self, Frame, FrameReader, FrameType};
use byteorder::{BigEndian, ByteOrder};
use crate::transport::Conn;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const FRAME_QUEUE: usize = 256;
const STREAM_WINDOW: usize = 32;
const WINDOW_UPDATE_BATCH: u32 = (STREAM_WINDOW / 2) as u32;
const STREAM_CHUNK: usize = 16 * 1024;
const PIPE_CAPACITY: usize = 64 * 1024;
const OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// A peer's request to open a virtual connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynRequest {
    pub stream_id: u32,
    pub target: String,
}

/// Snapshot of a session for the administrative surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub peer: String,
    pub age_secs: u64,
    pub streams: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub closed: bool,
}

/// Snapshot of one virtual connection.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub stream_id: u32,
    pub target: String,
    pub age_secs: u64,
}

struct StreamSlot {
    target: String,
    opened_at: Instant,
    inbound: Option<mpsc::Sender<Vec<u8>>>,
    pending: Option<oneshot::Sender<Result<(), String>>>,
    credits: Arc<Semaphore>,
    cancel: CancellationToken,
}

pub struct Session {
    id: String,
    peer: String,
    created_at: Instant,
    frames: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<u32, StreamSlot>>,
    next_stream_id: AtomicU32,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    closed: CancellationToken,
}

impl Session {
    /// Starts the reader and writer tasks over an authenticated connection.
    ///
    /// `syn_tx` receives the peer's open requests; sessions without one
    /// refuse every inbound open.
    pub fn spawn(
        id: String,
        peer: String,
        reader: FrameReader<ReadHalf<Conn>>,
        writer: WriteHalf<Conn>,
        syn_tx: Option<mpsc::Sender<SynRequest>>,
    ) -> Arc<Session> {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        // Accepting ends open even ids so both ends never pick the same one
        let first_stream_id = if syn_tx.is_some() { 2 } else { 1 };
        let session = Arc::new(Session {
            id,
            peer,
            created_at: Instant::now(),
            frames: frames_tx,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(first_stream_id),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            closed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(writer, frames_rx, session.closed.clone()));

        let reader_session = session.clone();
        tokio::spawn(async move {
            match reader_session.read_loop(reader, syn_tx).await {
                Ok(()) => debug!(session_id = %reader_session.id, "Tunnel session ended"),
                Err(e) => warn!(session_id = %reader_session.id, error = %e, "Tunnel session failed"),
            }
            reader_session.shutdown();
        });

        info!(session_id = %session.id, peer = %session.peer, "Tunnel session started");
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session has shut down.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Tears the session down; every open stream is aborted.
    pub fn close(&self) {
        self.shutdown();
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            peer: self.peer.clone(),
            age_secs: self.created_at.elapsed().as_secs(),
            streams: self.slots().len(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }

    pub fn streams(&self) -> Vec<StreamInfo> {
        let mut streams: Vec<StreamInfo> = self
            .slots()
            .iter()
            .map(|(id, slot)| StreamInfo {
                stream_id: *id,
                target: slot.target.clone(),
                age_secs: slot.opened_at.elapsed().as_secs(),
            })
            .collect();
        streams.sort_by_key(|s| s.stream_id);
        streams
    }

    /// Opens a virtual connection to `target` through the peer.
    pub async fn open_stream(self: &Arc<Self>, target: &str) -> TunnelResult<Conn> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }

        let stream_id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (result_tx, result_rx) = oneshot::channel();
        // Data may follow the result immediately, so the inbound side exists first
        let (inbound_tx, inbound_rx) = mpsc::channel(STREAM_WINDOW);
        let credits = Arc::new(Semaphore::new(STREAM_WINDOW));
        let cancel = self.closed.child_token();
        self.slots().insert(
            stream_id,
            StreamSlot {
                target: target.to_string(),
                opened_at: Instant::now(),
                inbound: Some(inbound_tx),
                pending: Some(result_tx),
                credits: credits.clone(),
                cancel: cancel.clone(),
            },
        );

        let syn = Frame::new(FrameType::Syn, stream_id, target.as_bytes().to_vec())?;
        if let Err(e) = self.send(syn).await {
            self.slots().remove(&stream_id);
            return Err(e);
        }

        let outcome = tokio::time::timeout(OPEN_TIMEOUT, result_rx).await;
        let refused = match outcome {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(reason))) => Some(TunnelError::RemoteDial {
                addr: target.to_string(),
                reason,
            }),
            Ok(Err(_)) => Some(TunnelError::Closed),
            Err(_) => Some(TunnelError::Timeout(format!("opening stream to {}", target))),
        };
        if let Some(err) = refused {
            self.slots().remove(&stream_id);
            return Err(err);
        }

        let (app, local) = tokio::io::duplex(PIPE_CAPACITY);
        self.spawn_relay(stream_id, Box::new(local), inbound_rx, credits, cancel);

        debug!(session_id = %self.id, stream_id, dest = %target, "Stream opened");
        Ok(Box::new(app))
    }

    /// Binds an inbound open request to an established outbound connection.
    pub async fn accept_stream(self: &Arc<Self>, request: SynRequest, conn: Conn) -> TunnelResult<()> {
        let (inbound_tx, inbound_rx) = mpsc::channel(STREAM_WINDOW);
        let credits = Arc::new(Semaphore::new(STREAM_WINDOW));
        let cancel = self.closed.child_token();
        // Registered before the result goes out: the peer only sends data after it
        self.slots().insert(
            request.stream_id,
            StreamSlot {
                target: request.target.clone(),
                opened_at: Instant::now(),
                inbound: Some(inbound_tx),
                pending: None,
                credits: credits.clone(),
                cancel: cancel.clone(),
            },
        );

        if let Err(e) = self.send(Frame::signal(FrameType::SynResult, request.stream_id)).await {
            self.slots().remove(&request.stream_id);
            return Err(e);
        }

        self.spawn_relay(request.stream_id, conn, inbound_rx, credits, cancel);
        Ok(())
    }

    /// Tells the peer an open request failed.
    pub async fn refuse_stream(&self, request: &SynRequest, reason: &str) -> TunnelResult<()> {
        let frame = Frame::new(
            FrameType::SynResult,
            request.stream_id,
            reason.as_bytes().to_vec(),
        )?;
        self.send(frame).await
    }

    /// Sends a keepalive probe.
    pub async fn ping(&self) -> TunnelResult<()> {
        self.send(Frame::signal(FrameType::Ping, 0)).await
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<u32, StreamSlot>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn shutdown(&self) {
        self.closed.cancel();
        // Dropping the senders ends every stream's inbound side
        self.slots().clear();
    }

    async fn send(&self, frame: Frame) -> TunnelResult<()> {
        self.frames.send(frame).await.map_err(|_| TunnelError::Closed)
    }

    fn spawn_relay(
        self: &Arc<Self>,
        stream_id: u32,
        conn: Conn,
        inbound_rx: mpsc::Receiver<Vec<u8>>,
        credits: Arc<Semaphore>,
        cancel: CancellationToken,
    ) {
        let session = self.clone();
        tokio::spawn(async move {
            let (rd, wr) = tokio::io::split(conn);
            tokio::join!(
                session.pump_outbound(stream_id, rd, &credits, &cancel),
                session.pump_inbound(stream_id, wr, inbound_rx, &cancel),
            );
            session.slots().remove(&stream_id);
            trace!(session_id = %session.id, stream_id, "Stream relay finished");
        });
    }

    // local connection → tunnel
    async fn pump_outbound<R: AsyncRead + Unpin>(
        &self,
        stream_id: u32,
        mut rd: R,
        credits: &Semaphore,
        cancel: &CancellationToken,
    ) {
        let mut buf = vec![0u8; STREAM_CHUNK];
        loop {
            let permit = tokio::select! {
                permit = credits.acquire() => permit,
                _ = cancel.cancelled() => return,
            };
            match permit {
                Ok(permit) => permit.forget(),
                Err(_) => return,
            }

            let read = tokio::select! {
                read = rd.read(&mut buf) => read,
                _ = cancel.cancelled() => return,
            };
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(stream_id, error = %e, "Local read failed, resetting stream");
                    let _ = self.send(Frame::signal(FrameType::Rst, stream_id)).await;
                    return;
                }
            };
            let frame = Frame {
                frame_type: FrameType::Data,
                stream_id,
                payload: buf[..n].to_vec(),
            };
            if self.send(frame).await.is_err() {
                return;
            }
            self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        }
        let _ = self.send(Frame::signal(FrameType::Fin, stream_id)).await;
    }

    // tunnel → local connection
    async fn pump_inbound<W: AsyncWrite + Unpin>(
        &self,
        stream_id: u32,
        mut wr: W,
        mut inbound_rx: mpsc::Receiver<Vec<u8>>,
        cancel: &CancellationToken,
    ) {
        let mut consumed = 0u32;
        loop {
            let data = tokio::select! {
                data = inbound_rx.recv() => data,
                _ = cancel.cancelled() => None,
            };
            let Some(data) = data else {
                break;
            };
            if wr.write_all(&data).await.is_err() {
                return;
            }

            consumed += 1;
            if consumed == WINDOW_UPDATE_BATCH {
                if self.send(window_update(stream_id, consumed)).await.is_err() {
                    return;
                }
                consumed = 0;
            }
        }
        let _ = wr.shutdown().await;
    }

    async fn read_loop(
        self: &Arc<Self>,
        mut reader: FrameReader<ReadHalf<Conn>>,
        syn_tx: Option<mpsc::Sender<SynRequest>>,
    ) -> TunnelResult<()> {
        loop {
            let next = tokio::select! {
                next = reader.next_frame() => next?,
                _ = self.closed.cancelled() => return Ok(()),
            };
            let Some(frame) = next else {
                return Ok(());
            };

            match frame.frame_type {
                FrameType::Data => self.deliver(frame.stream_id, frame.payload).await,
                FrameType::Fin => {
                    if let Some(slot) = self.slots().get_mut(&frame.stream_id) {
                        slot.inbound = None;
                    }
                }
                FrameType::Rst => {
                    if let Some(slot) = self.slots().remove(&frame.stream_id) {
                        slot.cancel.cancel();
                    }
                }
                FrameType::SynResult => {
                    let pending = self
                        .slots()
                        .get_mut(&frame.stream_id)
                        .and_then(|slot| slot.pending.take());
                    if let Some(pending) = pending {
                        let result = if frame.payload.is_empty() {
                            Ok(())
                        } else {
                            Err(String::from_utf8_lossy(&frame.payload).into_owned())
                        };
                        let _ = pending.send(result);
                    }
                }
                FrameType::Syn => {
                    let request = SynRequest {
                        stream_id: frame.stream_id,
                        target: String::from_utf8_lossy(&frame.payload).into_owned(),
                    };
                    match &syn_tx {
                        Some(tx) => tx.send(request).await.map_err(|_| TunnelError::Closed)?,
                        None => self.refuse_stream(&request, "peer does not accept streams").await?,
                    }
                }
                FrameType::WindowUpdate => {
                    if frame.payload.len() != 4 {
                        return Err(TunnelError::Protocol(format!(
                            "window update of {} bytes",
                            frame.payload.len()
                        )));
                    }
                    let granted = BigEndian::read_u32(&frame.payload) as usize;
                    if let Some(slot) = self.slots().get(&frame.stream_id) {
                        let room = STREAM_WINDOW.saturating_sub(slot.credits.available_permits());
                        slot.credits.add_permits(granted.min(room));
                    }
                }
                FrameType::Ping => self.send(Frame::signal(FrameType::Pong, 0)).await?,
                FrameType::Pong => {}
                FrameType::Auth => {
                    return Err(TunnelError::Protocol(
                        "auth frame inside established session".into(),
                    ));
                }
            }
        }
    }

    async fn deliver(&self, stream_id: u32, payload: Vec<u8>) {
        let len = payload.len() as u64;
        let inbound = self
            .slots()
            .get(&stream_id)
            .and_then(|slot| slot.inbound.clone());
        let Some(inbound) = inbound else {
            trace!(stream_id, "Data for unknown stream dropped");
            return;
        };
        let reason = match inbound.try_send(payload) {
            Ok(()) => {
                self.bytes_received.fetch_add(len, Ordering::Relaxed);
                return;
            }
            Err(TrySendError::Full(_)) => "peer overran the stream window",
            Err(TrySendError::Closed(_)) => "local side closed",
        };
        debug!(session_id = %self.id, stream_id, reason, "Resetting stream");
        if let Some(slot) = self.slots().remove(&stream_id) {
            slot.cancel.cancel();
        }
        let _ = self.send(Frame::signal(FrameType::Rst, stream_id)).await;
    }
}

fn window_update(stream_id: u32, frames: u32) -> Frame {
    let mut payload = vec![0u8; 4];
    BigEndian::write_u32(&mut payload, frames);
    Frame {
        frame_type: FrameType::WindowUpdate,
        stream_id,
        payload,
    }
}

async fn write_loop(
    mut writer: WriteHalf<Conn>,
    mut frames_rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = frames_rx.recv() => frame,
            _ = closed.cancelled() => None,
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(e) = writer.write_all(&frame::encode(&frame)).await {
            debug!(error = %e, "Tunnel write failed");
            closed.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (Arc<Session>, Arc<Session>, mpsc::Receiver<SynRequest>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_rd, a_wr) = tokio::io::split(Box::new(a) as Conn);
        let (b_rd, b_wr) = tokio::io::split(Box::new(b) as Conn);
        let (syn_tx, syn_rx) = mpsc::channel(8);
        let client = Session::spawn("c".into(), "server".into(), FrameReader::new(a_rd), a_wr, None);
        let server = Session::spawn(
            "s".into(),
            "client".into(),
            FrameReader::new(b_rd),
            b_wr,
            Some(syn_tx),
        );
        (client, server, syn_rx)
    }

    #[tokio::test]
    async fn test_stream_relays_both_directions() {
        let (client, server, mut syn_rx) = session_pair();

        let acceptor = tokio::spawn(async move {
            let request = syn_rx.recv().await.unwrap();
            assert_eq!(request.target, "upstream:80");
            let (near, far) = tokio::io::duplex(4096);
            server.accept_stream(request, Box::new(near)).await.unwrap();
            (server, far)
        });

        let mut stream = client.open_stream("upstream:80").await.unwrap();
        let (server, mut far) = acceptor.await.unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        far.write_all(b"pong").await.unwrap();
        drop(far);
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");

        assert_eq!(client.info().bytes_sent, 4);
        assert_eq!(server.info().bytes_received, 4);
    }

    #[tokio::test]
    async fn test_stalled_stream_does_not_block_others() {
        let (client, server, mut syn_rx) = session_pair();

        let (far_tx, mut far_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(request) = syn_rx.recv().await {
                let (near, far) = tokio::io::duplex(4096);
                server.accept_stream(request, Box::new(near)).await.unwrap();
                far_tx.send(far).unwrap();
            }
        });

        // Never read from this stream while its upstream floods it
        let _stalled = client.open_stream("bulk:80").await.unwrap();
        let mut bulk = far_rx.recv().await.unwrap();
        tokio::spawn(async move {
            let _ = bulk.write_all(&vec![7u8; 8 * 1024 * 1024]).await;
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let echo = async {
            let mut stream = client.open_stream("echo:80").await.unwrap();
            let mut far = far_rx.recv().await.unwrap();
            stream.write_all(b"still alive").await.unwrap();
            let mut buf = [0u8; 11];
            far.read_exact(&mut buf).await.unwrap();
            far.write_all(&buf).await.unwrap();
            let mut back = [0u8; 11];
            stream.read_exact(&mut back).await.unwrap();
            back
        };
        let back = tokio::time::timeout(Duration::from_secs(3), echo).await.unwrap();
        assert_eq!(&back, b"still alive");
    }

    #[tokio::test]
    async fn test_large_transfer_survives_window_updates() {
        let (client, server, mut syn_rx) = session_pair();

        tokio::spawn(async move {
            let request = syn_rx.recv().await.unwrap();
            let (near, mut far) = tokio::io::duplex(4096);
            server.accept_stream(request, Box::new(near)).await.unwrap();
            far.write_all(&vec![3u8; 2 * 1024 * 1024]).await.unwrap();
            far.shutdown().await.unwrap();
            server
        });

        let mut stream = client.open_stream("download:80").await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), 2 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_refused_stream_reports_reason() {
        let (client, server, mut syn_rx) = session_pair();

        tokio::spawn(async move {
            let request = syn_rx.recv().await.unwrap();
            server.refuse_stream(&request, "connection refused").await.unwrap();
            server
        });

        match client.open_stream("nowhere:1").await {
            Err(TunnelError::RemoteDial { addr, reason }) => {
                assert_eq!(addr, "nowhere:1");
                assert_eq!(reason, "connection refused");
            }
            other => panic!("expected RemoteDial, got {:?}", other.map(|_| ())),
        }
        assert!(client.streams().is_empty());
    }

    #[tokio::test]
    async fn test_session_without_acceptor_refuses_opens() {
        let (client, server, _syn_rx) = session_pair();
        // The client side has no acceptor
        let result = server.open_stream("anything:1").await;
        assert!(matches!(result, Err(TunnelError::RemoteDial { .. })));
        drop(client);
    }

    #[tokio::test]
    async fn test_close_fails_new_opens() {
        let (client, _server, _syn_rx) = session_pair();
        client.close();
        client.closed().await;
        assert!(client.is_closed());
        assert!(matches!(
            client.open_stream("a:1").await,
            Err(TunnelError::Closed)
        ));
    }
}
