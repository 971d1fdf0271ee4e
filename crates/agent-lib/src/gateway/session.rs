//! Reconnecting gateway session
//!
//! The session owns one persistent framed channel to the control plane:
//! request/response sends keyed by frame seq, listener dispatch for
//! server-pushed packets, a bounded outbound queue drained by a single
//! writer task, and a reconnect loop with a wrapping backoff multiplier.
//! Authentication rejection is terminal; everything else reconnects.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex, Notify, RwLock};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use super::frame::{Frame, FrameCodec, PacketKind};
use super::packets::{
    self, PacketAuth, PacketAuthOk, PacketAuthReject, PacketBye, PacketLog,
    PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION,
};

/// Gateway session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub gateway_url: String,
    pub account_id: Uuid,
    pub cluster_id: Uuid,
    /// Decoded client secret.
    pub secret: Vec<u8>,
    pub agent_version: String,
    /// Unique id of this process start, echoed in the handshake.
    pub start_id: Uuid,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub reconnect_timeout: Duration,
    pub backoff_step: Duration,
    /// Mirror warn/error log lines to the control plane.
    pub send_logs: bool,
    pub outbound_queue_size: usize,
}

impl SessionConfig {
    pub fn new(gateway_url: impl Into<String>, account_id: Uuid, cluster_id: Uuid) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            account_id,
            cluster_id,
            secret: Vec::new(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            start_id: Uuid::new_v4(),
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            reconnect_timeout: Duration::from_secs(1),
            backoff_step: Duration::from_millis(300),
            send_logs: true,
            outbound_queue_size: 320,
        }
    }
}

/// Observable connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Authenticated,
    Draining,
    Closed,
}

/// Why the session loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// `done()` completed a graceful shutdown.
    Clean,
    /// The gateway rejected the credentials; terminal.
    AuthRejected(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("connection lost before the response arrived")]
    ConnectionLost,
}

/// Reply produced by a push-packet listener, written back with the
/// request's seq and the response flag.
pub struct Reply {
    pub kind: PacketKind,
    pub payload: Vec<u8>,
}

/// Handler for server-pushed packets. Handlers run on the reader task and
/// must not block indefinitely.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<Option<Reply>>;
}

struct Outbound {
    frame: Frame,
    /// Fire-and-forget frames may be evicted on queue overflow.
    droppable: bool,
}

enum ServeEnd {
    Lost {
        cause: anyhow::Error,
        /// A completed handshake restarts the backoff sequence.
        authenticated: bool,
    },
    Draining,
    AuthRejected(String),
}

/// Framed reconnecting channel to the control plane.
pub struct Session {
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    closing: watch::Sender<bool>,
    seq: AtomicU64,
    queue: Mutex<VecDeque<Outbound>>,
    queue_notify: Notify,
    pending: Mutex<HashMap<u64, oneshot::Sender<Bytes>>>,
    in_flight: Mutex<HashSet<u64>>,
    listeners: RwLock<HashMap<u16, Arc<dyn PacketHandler>>>,
    exit_status: Mutex<Option<i32>>,
    dropped_frames: AtomicU64,
    reconnects: AtomicU64,
}

impl Session {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Connecting);
        let (closing, _) = watch::channel(false);
        Arc::new(Self {
            config,
            state,
            closing,
            seq: AtomicU64::new(1),
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            pending: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            listeners: RwLock::new(HashMap::new()),
            exit_status: Mutex::new(None),
            dropped_frames: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Registers the handler for a server-push packet kind.
    pub async fn add_listener(&self, kind: PacketKind, handler: Arc<dyn PacketHandler>) {
        self.listeners.write().await.insert(kind as u16, handler);
    }

    /// Synchronous request/response. Blocks through a reconnect until the
    /// next successful handshake or session close.
    pub async fn send(&self, kind: PacketKind, payload: Vec<u8>) -> Result<Bytes> {
        self.wait_authenticated().await?;
        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);
        self.enqueue(Frame::new(seq, kind, payload), false).await;
        rx.await.map_err(|_| SessionError::ConnectionLost.into())
    }

    /// Fire-and-forget delivery; queued across reconnects, oldest batch
    /// dropped on overflow.
    pub async fn send_batch(&self, kind: PacketKind, payload: Vec<u8>) -> Result<()> {
        if matches!(self.state(), SessionState::Draining | SessionState::Closed) {
            return Err(SessionError::Closed.into());
        }
        self.enqueue(Frame::new(self.next_seq(), kind, payload), true)
            .await;
        Ok(())
    }

    /// Logs locally and mirrors the line to the control plane unless log
    /// shipping is disabled.
    pub async fn log_info(&self, message: &str) {
        info!("{message}");
        self.mirror_log("info", message).await;
    }

    pub async fn log_fatal(&self, message: &str) {
        error!("{message}");
        self.mirror_log("fatal", message).await;
    }

    async fn mirror_log(&self, level: &str, message: &str) {
        if !self.config.send_logs {
            return;
        }
        if matches!(self.state(), SessionState::Closed) {
            return;
        }
        if let Ok(payload) = packets::encode(&PacketLog {
            level: level.to_string(),
            message: message.to_string(),
        }) {
            self.enqueue(Frame::new(self.next_seq(), PacketKind::Log, payload), true)
                .await;
        }
    }

    /// Graceful shutdown: transmit Bye, drain in-flight writes up to the
    /// write timeout, then stop the connection loop. Idempotent.
    pub async fn done(&self, status: i32) {
        {
            let mut exit = self.exit_status.lock().await;
            if exit.is_some() {
                return;
            }
            *exit = Some(status);
        }
        info!(status, "closing gateway session");
        if self.state() != SessionState::Closed {
            self.state.send_replace(SessionState::Draining);
        }

        if let Ok(payload) = packets::encode(&PacketBye { status }) {
            self.enqueue(Frame::new(self.next_seq(), PacketKind::Bye, payload), false)
                .await;
        }

        let deadline = Instant::now() + self.config.write_timeout;
        while Instant::now() < deadline {
            if self.queue.lock().await.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        self.closing.send_replace(true);
    }

    /// Last-resort trap: converts an unhandled panic into a final
    /// Bye(fatal) plus a logged trace.
    pub async fn recover(&self, panic_message: &str) {
        error!(panic = panic_message, "panic trapped, sending final bye");
        self.mirror_log("fatal", panic_message).await;
        self.done(1).await;
    }

    /// Blocks until the connection loop has fully exited.
    pub async fn wait_exit(&self) {
        let mut state = self.state.subscribe();
        loop {
            if *state.borrow() == SessionState::Closed {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Connection loop; runs until graceful shutdown or auth rejection.
    pub async fn run(self: Arc<Self>) -> SessionEnd {
        let mut attempt = 0u32;
        let end = loop {
            if *self.closing.borrow() {
                break SessionEnd::Clean;
            }
            self.state.send_replace(SessionState::Connecting);

            match Arc::clone(&self).connect_and_serve().await {
                ServeEnd::Draining => break SessionEnd::Clean,
                ServeEnd::AuthRejected(reason) => {
                    error!(reason = %reason, "gateway rejected authentication");
                    break SessionEnd::AuthRejected(reason);
                }
                ServeEnd::Lost {
                    cause,
                    authenticated,
                } => {
                    if authenticated {
                        attempt = 0;
                    }
                    attempt += 1;
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.fail_in_flight().await;
                    if *self.closing.borrow() {
                        break SessionEnd::Clean;
                    }
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        error = %cause,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "gateway connection lost, reconnecting"
                    );
                    let mut closing = self.closing.subscribe();
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = closing.changed() => break SessionEnd::Clean,
                    }
                }
            }
        };

        self.fail_all_pending().await;
        self.state.send_replace(SessionState::Closed);
        end
    }

    async fn connect_and_serve(self: Arc<Self>) -> ServeEnd {
        let framed = match self.connect_and_authenticate().await {
            Ok(Ok(framed)) => framed,
            Ok(Err(reason)) => return ServeEnd::AuthRejected(reason),
            Err(cause) => {
                return ServeEnd::Lost {
                    cause,
                    authenticated: false,
                }
            }
        };

        self.state.send_replace(SessionState::Authenticated);
        info!(gateway = %self.config.gateway_url, "authenticated with gateway");

        let (writer, reader) = framed.split();
        let (conn_down_tx, conn_down_rx) = watch::channel(false);

        let writer_task = tokio::spawn(Arc::clone(&self).write_loop(
            writer,
            conn_down_rx.clone(),
            conn_down_tx.clone(),
        ));

        let end = self.read_loop(reader, conn_down_rx).await;

        conn_down_tx.send_replace(true);
        let _ = writer_task.await;
        end
    }

    /// Opens the channel and completes the handshake.
    ///
    /// Outer error means the connection is retryable, inner `Err` is an
    /// authentication rejection.
    async fn connect_and_authenticate(
        &self,
    ) -> Result<Result<Framed<TcpStream, FrameCodec>, String>> {
        let (host, port) = self.endpoint()?;
        debug!(host = %host, port, "connecting to gateway");

        let stream = timeout(self.config.handshake_timeout, TcpStream::connect((host, port)))
            .await
            .context("gateway connect timed out")?
            .context("gateway connect failed")?;
        let mut framed = Framed::new(stream, FrameCodec);

        self.state.send_replace(SessionState::Handshaking);

        let auth = PacketAuth {
            account_id: self.config.account_id,
            cluster_id: self.config.cluster_id,
            secret: base64_encode(&self.config.secret),
            agent_version: self.config.agent_version.clone(),
            start_id: self.config.start_id,
            protocol_major: PROTOCOL_MAJOR_VERSION,
            protocol_minor: PROTOCOL_MINOR_VERSION,
        };
        let frame = Frame::new(self.next_seq(), PacketKind::Auth, packets::encode(&auth)?);
        timeout(self.config.write_timeout, framed.send(frame))
            .await
            .context("auth write timed out")?
            .context("auth write failed")?;

        let reply = timeout(self.config.read_timeout, framed.next())
            .await
            .context("auth response timed out")?
            .context("gateway closed the channel during handshake")?
            .context("auth response unreadable")?;

        match reply.packet_kind() {
            Some(PacketKind::AuthOk) => {
                let ok: PacketAuthOk = packets::decode(&reply.payload).unwrap_or_default();
                if ok.protocol_minor != PROTOCOL_MINOR_VERSION && ok.protocol_minor != 0 {
                    warn!(
                        ours = PROTOCOL_MINOR_VERSION,
                        gateway = ok.protocol_minor,
                        "protocol minor version mismatch"
                    );
                }
                Ok(Ok(framed))
            }
            Some(PacketKind::AuthReject) => {
                let reject: PacketAuthReject = packets::decode(&reply.payload).unwrap_or_default();
                Ok(Err(reject.reason))
            }
            other => anyhow::bail!("unexpected handshake reply: {other:?}"),
        }
    }

    /// Single writer per connection: drains the outbound queue in order.
    async fn write_loop(
        self: Arc<Self>,
        mut writer: SplitSink<Framed<TcpStream, FrameCodec>, Frame>,
        mut conn_down: watch::Receiver<bool>,
        conn_down_tx: watch::Sender<bool>,
    ) {
        loop {
            let Some(frame) = self.dequeue(&mut conn_down).await else {
                break;
            };
            let seq = frame.seq;
            let is_bye = frame.packet_kind() == Some(PacketKind::Bye);
            let recover = frame.clone();

            match timeout(self.config.write_timeout, writer.send(frame)).await {
                Ok(Ok(())) => {
                    self.in_flight.lock().await.insert(seq);
                    if is_bye {
                        let _ = writer.flush().await;
                        break;
                    }
                }
                Ok(Err(cause)) => {
                    warn!(error = %cause, "gateway write failed");
                    self.requeue_front(recover).await;
                    conn_down_tx.send_replace(true);
                    break;
                }
                Err(_) => {
                    warn!("gateway write timed out");
                    self.requeue_front(recover).await;
                    conn_down_tx.send_replace(true);
                    break;
                }
            }
        }
    }

    /// Single reader per connection: classifies frames and dispatches.
    async fn read_loop(
        &self,
        mut reader: SplitStream<Framed<TcpStream, FrameCodec>>,
        mut conn_down: watch::Receiver<bool>,
    ) -> ServeEnd {
        let lost = |cause: anyhow::Error| ServeEnd::Lost {
            cause,
            authenticated: true,
        };
        let mut closing = self.closing.subscribe();
        loop {
            tokio::select! {
                next = timeout(self.config.read_timeout, reader.next()) => {
                    match next {
                        Err(_) => return lost(anyhow::anyhow!("read deadline exceeded")),
                        Ok(None) => {
                            if *self.closing.borrow() {
                                return ServeEnd::Draining;
                            }
                            return lost(anyhow::anyhow!("gateway closed the channel"));
                        }
                        Ok(Some(Err(cause))) => {
                            return lost(anyhow::Error::from(cause).context("read failed"))
                        }
                        Ok(Some(Ok(frame))) => self.dispatch(frame).await,
                    }
                }
                _ = conn_down.changed() => {
                    return lost(anyhow::anyhow!("writer reported the connection down"));
                }
                _ = closing.changed() => return ServeEnd::Draining,
            }
        }
    }

    async fn dispatch(&self, frame: Frame) {
        if frame.is_response() {
            let waiter = self.pending.lock().await.remove(&frame.seq);
            self.in_flight.lock().await.remove(&frame.seq);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(frame.payload);
                }
                None => warn!(seq = frame.seq, "response for unknown request, dropping"),
            }
            return;
        }

        let Some(kind) = frame.packet_kind() else {
            warn!(kind = frame.kind, "unknown packet kind, dropping");
            return;
        };

        let handler = self.listeners.read().await.get(&frame.kind).cloned();
        let Some(handler) = handler else {
            warn!(?kind, "no listener registered for packet kind, dropping");
            return;
        };

        match handler.handle(&frame.payload).await {
            Ok(Some(reply)) => {
                self.enqueue(Frame::response(frame.seq, reply.kind, reply.payload), false)
                    .await;
            }
            Ok(None) => {}
            Err(cause) => error!(?kind, error = %cause, "packet listener failed"),
        }
    }

    async fn enqueue(&self, frame: Frame, droppable: bool) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.config.outbound_queue_size {
            if let Some(position) = queue.iter().position(|entry| entry.droppable) {
                queue.remove(position);
                let dropped = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped_total = dropped, "outbound queue full, dropped oldest batch");
            }
        }
        queue.push_back(Outbound { frame, droppable });
        drop(queue);
        self.queue_notify.notify_one();
    }

    async fn requeue_front(&self, frame: Frame) {
        self.queue.lock().await.push_front(Outbound {
            frame,
            droppable: false,
        });
    }

    /// Pops the next outbound frame, waiting for one to arrive. Returns
    /// `None` once the connection is down, or when draining with an empty
    /// queue.
    async fn dequeue(&self, conn_down: &mut watch::Receiver<bool>) -> Option<Frame> {
        loop {
            if *conn_down.borrow() {
                return None;
            }
            if let Some(entry) = self.queue.lock().await.pop_front() {
                return Some(entry.frame);
            }
            if *self.closing.borrow() {
                return None;
            }
            let mut closing = self.closing.subscribe();
            tokio::select! {
                _ = self.queue_notify.notified() => {}
                _ = conn_down.changed() => {}
                _ = closing.changed() => {}
            }
        }
    }

    async fn wait_authenticated(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        loop {
            match *state.borrow() {
                SessionState::Authenticated => return Ok(()),
                SessionState::Draining | SessionState::Closed => {
                    return Err(SessionError::Closed.into())
                }
                _ => {}
            }
            if state.changed().await.is_err() {
                return Err(SessionError::Closed.into());
            }
        }
    }

    /// Requests transmitted on a connection that died never get answered;
    /// queued-but-untransmitted requests survive for the next connection.
    async fn fail_in_flight(&self) {
        let seqs: Vec<u64> = self.in_flight.lock().await.drain().collect();
        if seqs.is_empty() {
            return;
        }
        let mut pending = self.pending.lock().await;
        for seq in seqs {
            pending.remove(&seq);
        }
    }

    async fn fail_all_pending(&self) {
        self.pending.lock().await.clear();
        self.in_flight.lock().await.clear();
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// `max(reconnect baseline, step * (((attempt-1) mod 10) + 1))`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let step = self.config.backoff_step * (((attempt - 1) % 10) + 1);
        self.config.reconnect_timeout.max(step)
    }

    fn endpoint(&self) -> Result<(String, u16)> {
        let url = Url::parse(&self.config.gateway_url)
            .with_context(|| format!("invalid gateway URL {}", self.config.gateway_url))?;
        let host = url
            .host_str()
            .context("gateway URL has no host")?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        Ok((host, port))
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::packets::{PacketDecision, PacketDecisionResult, PacketMetrics};
    use tokio::net::TcpListener;

    fn test_config(port: u16) -> SessionConfig {
        let mut config = SessionConfig::new(
            format!("ws://127.0.0.1:{port}"),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );
        config.secret = b"secret".to_vec();
        config.reconnect_timeout = Duration::from_millis(20);
        config.backoff_step = Duration::from_millis(10);
        config
    }

    async fn accept_and_auth(
        listener: &TcpListener,
    ) -> Framed<TcpStream, FrameCodec> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec);

        let auth = framed.next().await.unwrap().unwrap();
        assert_eq!(auth.packet_kind(), Some(PacketKind::Auth));
        let payload: PacketAuth = packets::decode(&auth.payload).unwrap();
        assert_eq!(payload.protocol_major, PROTOCOL_MAJOR_VERSION);

        let ok = packets::encode(&PacketAuthOk {
            protocol_major: PROTOCOL_MAJOR_VERSION,
            protocol_minor: PROTOCOL_MINOR_VERSION,
        })
        .unwrap();
        framed
            .send(Frame::response(auth.seq, PacketKind::AuthOk, ok))
            .await
            .unwrap();
        framed
    }

    struct EchoDecisionHandler;

    #[async_trait]
    impl PacketHandler for EchoDecisionHandler {
        async fn handle(&self, payload: &[u8]) -> Result<Option<Reply>> {
            let decision: PacketDecision = packets::decode(payload)?;
            let result = PacketDecisionResult {
                id: decision.id,
                status: super::super::packets::DecisionStatus::Applied,
                reason: String::new(),
            };
            Ok(Some(Reply {
                kind: PacketKind::DecisionResult,
                payload: packets::encode(&result)?,
            }))
        }
    }

    #[tokio::test]
    async fn test_handshake_request_response_and_push() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let session = Session::new(test_config(port));
        session
            .add_listener(PacketKind::Decision, Arc::new(EchoDecisionHandler))
            .await;
        let run = tokio::spawn(Arc::clone(&session).run());

        let mut server = accept_and_auth(&listener).await;

        // Client request answered by seq.
        let client = Arc::clone(&session);
        let request = tokio::spawn(async move {
            client
                .send(
                    PacketKind::Metrics,
                    packets::encode(&PacketMetrics::default()).unwrap(),
                )
                .await
        });
        let inbound = server.next().await.unwrap().unwrap();
        assert_eq!(inbound.packet_kind(), Some(PacketKind::Metrics));
        server
            .send(Frame::response(inbound.seq, PacketKind::Metrics, &b"ok"[..]))
            .await
            .unwrap();
        let response = request.await.unwrap().unwrap();
        assert_eq!(&response[..], b"ok");

        // Server push dispatches to the listener; the reply reuses the seq.
        let decision = PacketDecision {
            id: Some(Uuid::new_v4()),
            kind: "Deployment".into(),
            name: "api".into(),
            namespace: "prod".into(),
            total_resources: Default::default(),
        };
        server
            .send(Frame::new(
                4242,
                PacketKind::Decision,
                packets::encode(&decision).unwrap(),
            ))
            .await
            .unwrap();
        let reply = server.next().await.unwrap().unwrap();
        assert_eq!(reply.seq, 4242);
        assert!(reply.is_response());
        assert_eq!(reply.packet_kind(), Some(PacketKind::DecisionResult));

        // Graceful shutdown transmits Bye.
        let session_done = Arc::clone(&session);
        let done = tokio::spawn(async move { session_done.done(0).await });
        let bye = server.next().await.unwrap().unwrap();
        assert_eq!(bye.packet_kind(), Some(PacketKind::Bye));
        done.await.unwrap();

        assert_eq!(run.await.unwrap(), SessionEnd::Clean);
        session.wait_exit().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_auth_rejection_is_terminal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let session = Session::new(test_config(port));
        let run = tokio::spawn(Arc::clone(&session).run());

        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec);
        let auth = framed.next().await.unwrap().unwrap();
        let reject = packets::encode(&PacketAuthReject {
            reason: "unknown cluster".into(),
        })
        .unwrap();
        framed
            .send(Frame::response(auth.seq, PacketKind::AuthReject, reject))
            .await
            .unwrap();

        assert_eq!(
            run.await.unwrap(),
            SessionEnd::AuthRejected("unknown cluster".into())
        );
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_batches_survive_reconnect_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let session = Session::new(test_config(port));
        let run = tokio::spawn(Arc::clone(&session).run());

        // First connection authenticates, then dies.
        let server = accept_and_auth(&listener).await;
        drop(server);

        // Batches queued while the channel is down.
        session
            .send_batch(PacketKind::Metrics, b"batch-1".to_vec())
            .await
            .unwrap();
        session
            .send_batch(PacketKind::Metrics, b"batch-2".to_vec())
            .await
            .unwrap();

        // Both arrive, in order, after the next handshake.
        let mut server = accept_and_auth(&listener).await;
        let first = server.next().await.unwrap().unwrap();
        assert_eq!(&first.payload[..], b"batch-1");
        let second = server.next().await.unwrap().unwrap();
        assert_eq!(&second.payload[..], b"batch-2");

        assert!(session.reconnects() >= 1);

        session.done(0).await;
        let _ = run.await;
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_oldest_batch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = test_config(port);
        config.outbound_queue_size = 2;

        // Never accepted: everything stays queued.
        let session = Session::new(config);
        for index in 0..3 {
            session
                .send_batch(PacketKind::Metrics, vec![index])
                .await
                .unwrap();
        }

        assert_eq!(session.dropped_frames(), 1);
        let queue = session.queue.lock().await;
        assert_eq!(queue.len(), 2);
        assert_eq!(&queue[0].frame.payload[..], &[1]);
        drop(queue);
        drop(listener);
    }

    #[test]
    fn test_backoff_delay_wraps_and_respects_baseline() {
        let mut config = test_config(1);
        config.reconnect_timeout = Duration::from_secs(1);
        config.backoff_step = Duration::from_millis(300);
        let session = Session::new(config);

        // Early attempts are held at the reconnect baseline.
        assert_eq!(session.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(session.backoff_delay(3), Duration::from_secs(1));
        // The multiplier takes over and caps at 10 steps.
        assert_eq!(session.backoff_delay(10), Duration::from_millis(3000));
        assert_eq!(session.backoff_delay(11), Duration::from_secs(1));
    }
}
