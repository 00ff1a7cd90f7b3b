//! One bridged client/backend pair.
//!
//! A session runs in the task axum spawns for the upgraded connection. The
//! client writer (sole owner of the WebSocket sink, draining the outbound
//! queue and sending liveness pings) starts immediately, so a client is
//! probed and can answer while the backend dial is still in flight. Client
//! lines received during the dial are held and relayed after the pre-relay
//! frames. Once the backend is connected two pumps join the writer:
//!
//! - the backend pump, turning backend lines into client text messages;
//! - the client pump, turning client messages into backend lines.
//!
//! The first of them to finish (or an eviction, or shutdown) decides the
//! [`CloseReason`]; both sockets are then released together.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::future::FusedFuture;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wsproxy_core::SessionId;

use crate::backend::{BackendConnector, PreRelay};
use crate::config::ServerConfig;
use crate::frame::{FrameError, LineCodec, split_frames, terminate};
use crate::listener::ConnectionParameters;
use crate::liveness::{LivenessMonitor, TrackedClient};
use crate::metrics::{
    BACKEND_DIAL_FAILURES_TOTAL, FRAMES_RELAYED_TOTAL, SESSIONS_ACTIVE, SESSIONS_TOTAL,
};

/// Tracing target carrying one event per relayed line.
pub const RELAY_TARGET: &str = "wsproxy_server::relay";

/// How long a closing session waits for queued client messages to flush.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of a session. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Backend dial in progress.
    Connecting,
    /// Relaying in both directions.
    Active,
    /// One side ended; tearing down the other.
    Closing,
    /// Both sockets released.
    Closed,
}

impl SessionState {
    /// Move to `next` if it is later in the lifecycle. Returns whether the
    /// state changed.
    pub fn advance(&mut self, next: Self) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent a close frame or its stream ended.
    ClientClosed,
    /// Reading from or writing to the client failed.
    ClientError,
    /// Backend reached end-of-stream.
    BackendClosed,
    /// Reading from or writing to the backend failed.
    BackendError,
    /// Backend connect or TLS handshake failed.
    DialFailed,
    /// Client missed a liveness probe.
    Evicted,
    /// Process is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Snake-case name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::ClientError => "client_error",
            Self::BackendClosed => "backend_closed",
            Self::BackendError => "backend_error",
            Self::DialFailed => "dial_failed",
            Self::Evicted => "evicted",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message queued for the client writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Text frame, already newline-terminated.
    Text(String),
    /// Send a close frame and stop.
    Close,
}

/// Server-wide handles every session needs.
#[derive(Clone, Debug)]
pub struct SessionContext {
    /// Resolved configuration.
    pub config: Arc<ServerConfig>,
    /// Backend dialer.
    pub connector: BackendConnector,
    /// Liveness supervision.
    pub monitor: Arc<LivenessMonitor>,
    /// Process shutdown signal.
    pub shutdown: CancellationToken,
}

/// Run a session to completion over an upgraded client socket.
pub async fn run<S, E>(socket: S, params: ConnectionParameters, ctx: SessionContext) -> CloseReason
where
    S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + Unpin,
    E: fmt::Display,
{
    let id = SessionId::new();
    let tracked = ctx.monitor.track(id.clone());
    let mode = ctx.config.mode;

    metrics::counter!(SESSIONS_TOTAL, "mode" => mode.as_str()).increment(1);
    metrics::gauge!(SESSIONS_ACTIVE).increment(1.0);
    info!(
        session_id = %id,
        host = %params.target.host,
        port = params.target.port,
        transport = %params.target.transport,
        mode = %mode,
        "session opened"
    );

    let pre = PreRelay::for_session(params.registration.as_ref(), &ctx.config.capabilities);
    let dial = ctx.connector.connect(&params.target);
    let reason = bridge(socket, dial, pre, &id, &tracked, &ctx).await;

    ctx.monitor.untrack(&id);
    metrics::gauge!(SESSIONS_ACTIVE).decrement(1.0);
    info!(session_id = %id, reason = %reason, "session closed");
    reason
}

/// Drive one session from dial to teardown.
///
/// `dial` resolves to the connected backend. While it is pending the client
/// is already supervised: pings go out, pongs are read, and text is held
/// back. Pre-relay frames are written before any held or later client line,
/// so they always come first on the backend.
pub async fn bridge<S, E, D, B>(
    socket: S,
    dial: D,
    pre: PreRelay,
    id: &SessionId,
    tracked: &Arc<TrackedClient>,
    ctx: &SessionContext,
) -> CloseReason
where
    S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + Unpin,
    E: fmt::Display,
    D: Future<Output = crate::error::Result<B>>,
    B: AsyncRead + AsyncWrite,
{
    let mut state = SessionState::Connecting;
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel(ctx.config.outbound_queue);
    let writer = client_writer(ws_tx, rx, Arc::clone(tracked), id.clone()).fuse();
    tokio::pin!(writer, dial);

    let mut held = Vec::new();
    let dialed = tokio::select! {
        result = &mut dial => Ok(result),
        reason = hold_client(&mut ws_rx, &mut held, tracked, id) => Err(reason),
        () = &mut writer => Err(CloseReason::ClientError),
        () = tracked.evicted() => Err(CloseReason::Evicted),
        () = ctx.shutdown.cancelled() => Err(CloseReason::Shutdown),
    };

    let reason = match dialed {
        Ok(Ok(backend)) => {
            let _ = state.advance(SessionState::Active);
            let (backend_rd, backend_wr) = tokio::io::split(backend);
            let max_line = ctx.config.max_line_bytes;
            let mut backend_lines = FramedRead::new(backend_rd, LineCodec::new(max_line));
            let mut backend_sink = FramedWrite::new(backend_wr, LineCodec::new(max_line));

            let ready = match pre {
                PreRelay::AnnounceToClient(line) => {
                    let _ = tx.send(Outbound::Text(terminate(line))).await;
                    Ok(())
                }
                PreRelay::WriteToBackend(lines) => {
                    debug!(session_id = %id, frames = lines.len(), "registering with backend");
                    write_all(&mut backend_sink, lines).await
                }
            };
            let ready = match ready {
                Ok(()) => forward_held(&mut backend_sink, &held, id).await,
                Err(e) => Err(e),
            };

            match ready {
                Err(e) => {
                    warn!(session_id = %id, error = %e, "backend registration failed");
                    CloseReason::BackendError
                }
                Ok(()) => {
                    let inbound = backend_to_client(&mut backend_lines, &tx, id);
                    let outbound = client_to_backend(&mut ws_rx, &mut backend_sink, tracked, id);
                    tokio::pin!(inbound, outbound);

                    tokio::select! {
                        reason = &mut inbound => reason,
                        reason = &mut outbound => reason,
                        () = &mut writer => CloseReason::ClientError,
                        () = tracked.evicted() => CloseReason::Evicted,
                        () = ctx.shutdown.cancelled() => CloseReason::Shutdown,
                    }
                }
            }
        }
        Ok(Err(e)) => {
            metrics::counter!(BACKEND_DIAL_FAILURES_TOTAL).increment(1);
            warn!(session_id = %id, error = %e, "backend dial failed");
            CloseReason::DialFailed
        }
        Err(reason) => reason,
    };
    if state == SessionState::Active {
        let _ = state.advance(SessionState::Closing);
    }
    debug!(session_id = %id, reason = %reason, "relay ended");

    // Evicted clients are dropped without a close frame.
    if reason != CloseReason::Evicted && !writer.is_terminated() {
        let _ = tx.try_send(Outbound::Close);
        drop(tx);
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            debug!(session_id = %id, "client did not drain before close");
        }
    }
    let _ = state.advance(SessionState::Closed);
    reason
}

/// Next text payload from the client. Pongs refresh liveness; pings are
/// answered by the WebSocket layer.
///
/// Cancel-safe: the only await point is the stream's `next`.
async fn next_client_text<M, E>(
    incoming: &mut M,
    tracked: &TrackedClient,
    id: &SessionId,
) -> Result<String, CloseReason>
where
    M: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        match incoming.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_owned()),
            Some(Ok(Message::Binary(bytes))) => {
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            Some(Ok(Message::Pong(_))) => tracked.mark_alive(),
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Close(_))) | None => return Err(CloseReason::ClientClosed),
            Some(Err(e)) => {
                debug!(session_id = %id, error = %e, "client read failed");
                return Err(CloseReason::ClientError);
            }
        }
    }
}

/// Read the client while the backend is not yet connected, holding any text
/// for later. Returns only when the client goes away.
async fn hold_client<M, E>(
    incoming: &mut M,
    held: &mut Vec<String>,
    tracked: &TrackedClient,
    id: &SessionId,
) -> CloseReason
where
    M: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        match next_client_text(incoming, tracked, id).await {
            Ok(text) => held.push(text),
            Err(reason) => return reason,
        }
    }
}

/// Backend lines to the client queue, FIFO.
pub async fn backend_to_client<R>(
    lines: &mut FramedRead<R, LineCodec>,
    tx: &mpsc::Sender<Outbound>,
    id: &SessionId,
) -> CloseReason
where
    R: AsyncRead + Unpin,
{
    loop {
        match lines.next().await {
            Some(Ok(line)) => {
                info!(target: RELAY_TARGET, session_id = %id, "<-- {line}");
                metrics::counter!(FRAMES_RELAYED_TOTAL, "direction" => "inbound").increment(1);
                if tx.send(Outbound::Text(terminate(&line))).await.is_err() {
                    return CloseReason::ClientError;
                }
            }
            Some(Err(e)) => {
                warn!(session_id = %id, error = %e, "backend read failed");
                return CloseReason::BackendError;
            }
            None => return CloseReason::BackendClosed,
        }
    }
}

/// Client messages to backend lines. Pongs refresh liveness.
pub async fn client_to_backend<M, E, W>(
    mut incoming: M,
    sink: &mut FramedWrite<W, LineCodec>,
    tracked: &TrackedClient,
    id: &SessionId,
) -> CloseReason
where
    M: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
    W: AsyncWrite + Unpin,
{
    loop {
        let text = match next_client_text(&mut incoming, tracked, id).await {
            Ok(text) => text,
            Err(reason) => return reason,
        };
        if let Err(e) = forward_text(sink, &text, id).await {
            warn!(session_id = %id, error = %e, "backend write failed");
            return CloseReason::BackendError;
        }
    }
}

/// Relay text held during the dial, oldest first.
async fn forward_held<W>(
    sink: &mut FramedWrite<W, LineCodec>,
    held: &[String],
    id: &SessionId,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    for text in held {
        forward_text(sink, text, id).await?;
    }
    Ok(())
}

/// Split one client message into lines and write them to the backend.
async fn forward_text<W>(
    sink: &mut FramedWrite<W, LineCodec>,
    text: &str,
    id: &SessionId,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let lines: Vec<&str> = split_frames(text).collect();
    for line in &lines {
        info!(target: RELAY_TARGET, session_id = %id, "--> {line}");
    }
    metrics::counter!(FRAMES_RELAYED_TOTAL, "direction" => "outbound")
        .increment(lines.len() as u64);
    write_all(sink, lines).await
}

/// Sole owner of the client sink. Sends queued messages and liveness pings
/// until the queue closes, a close is requested, or a send fails.
pub async fn client_writer<K>(
    mut sink: K,
    mut rx: mpsc::Receiver<Outbound>,
    tracked: Arc<TrackedClient>,
    id: SessionId,
) where
    K: Sink<Message> + Unpin,
    K::Error: fmt::Display,
{
    loop {
        let result = tokio::select! {
            biased;
            () = tracked.probe_requested() => sink.send(Message::Ping(Default::default())).await,
            next = rx.recv() => match next {
                Some(Outbound::Text(text)) => sink.send(Message::Text(text.into())).await,
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    return;
                }
            },
        };
        if let Err(e) = result {
            debug!(session_id = %id, error = %e, "client write failed");
            return;
        }
    }
}

async fn write_all<W, I, T>(sink: &mut FramedWrite<W, LineCodec>, lines: I) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    for line in lines {
        sink.feed(line).await?;
    }
    SinkExt::<T>::flush(sink).await
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use futures::channel::mpsc as fmpsc;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use wsproxy_settings::ProxyMode;

    use super::*;
    use crate::listener::Registration;

    /// Client socket backed by two in-memory channels.
    struct FakeSocket {
        incoming: fmpsc::UnboundedReceiver<Result<Message, axum::Error>>,
        outgoing: fmpsc::UnboundedSender<Message>,
    }

    impl Stream for FakeSocket {
        type Item = Result<Message, axum::Error>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.incoming.poll_next_unpin(cx)
        }
    }

    impl Sink<Message> for FakeSocket {
        type Error = axum::Error;

        fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.outgoing.poll_ready_unpin(cx).map_err(axum::Error::new)
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            self.outgoing.start_send_unpin(item).map_err(axum::Error::new)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.outgoing.poll_flush_unpin(cx).map_err(axum::Error::new)
        }

        fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.outgoing.poll_close_unpin(cx).map_err(axum::Error::new)
        }
    }

    type ClientEnds = (
        fmpsc::UnboundedSender<Result<Message, axum::Error>>,
        fmpsc::UnboundedReceiver<Message>,
    );

    fn fake_socket() -> (FakeSocket, ClientEnds) {
        let (in_tx, in_rx) = fmpsc::unbounded();
        let (out_tx, out_rx) = fmpsc::unbounded();
        (
            FakeSocket {
                incoming: in_rx,
                outgoing: out_tx,
            },
            (in_tx, out_rx),
        )
    }

    fn context(mode: ProxyMode) -> SessionContext {
        let config = ServerConfig {
            mode,
            ping_interval: Duration::from_secs(3600),
            ..ServerConfig::default()
        };
        SessionContext {
            monitor: Arc::new(LivenessMonitor::new(config.ping_interval)),
            config: Arc::new(config),
            connector: BackendConnector::new(false).unwrap(),
            shutdown: CancellationToken::new(),
        }
    }

    fn spawn_bridge(
        socket: FakeSocket,
        backend: tokio::io::DuplexStream,
        pre: PreRelay,
        ctx: SessionContext,
    ) -> tokio::task::JoinHandle<CloseReason> {
        spawn_dialing(socket, std::future::ready(Ok(backend)), pre, ctx).0
    }

    /// Spawn a session whose backend is whatever `dial` resolves to.
    fn spawn_dialing<D>(
        socket: FakeSocket,
        dial: D,
        pre: PreRelay,
        ctx: SessionContext,
    ) -> (tokio::task::JoinHandle<CloseReason>, Arc<TrackedClient>)
    where
        D: std::future::Future<Output = crate::error::Result<tokio::io::DuplexStream>>
            + Send
            + 'static,
    {
        let id = SessionId::new();
        let tracked = ctx.monitor.track(id.clone());
        let client = Arc::clone(&tracked);
        let handle = tokio::spawn(async move { bridge(socket, dial, pre, &id, &tracked, &ctx).await });
        (handle, client)
    }

    async fn wait_alive(client: &TrackedClient) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !client.is_alive() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    fn tracked() -> (Arc<LivenessMonitor>, Arc<TrackedClient>) {
        let monitor = Arc::new(LivenessMonitor::new(Duration::from_secs(3600)));
        let client = monitor.track(SessionId::new());
        (monitor, client)
    }

    fn text(s: &str) -> Result<Message, axum::Error> {
        Ok(Message::Text(s.into()))
    }

    #[test]
    fn state_only_moves_forward() {
        let mut state = SessionState::Connecting;
        assert!(state.advance(SessionState::Active));
        assert!(state.advance(SessionState::Closing));
        assert!(!state.advance(SessionState::Active));
        assert!(!state.advance(SessionState::Closing));
        assert!(state.advance(SessionState::Closed));
        assert_eq!(state, SessionState::Closed);
    }

    #[test]
    fn dial_failure_skips_active() {
        let mut state = SessionState::Connecting;
        assert!(state.advance(SessionState::Closed));
        assert!(!state.advance(SessionState::Active));
    }

    #[test]
    fn close_reason_names() {
        assert_eq!(CloseReason::BackendClosed.to_string(), "backend_closed");
        assert_eq!(CloseReason::Evicted.as_str(), "evicted");
    }

    #[tokio::test]
    async fn backend_chunk_becomes_separate_client_frames() {
        let (mut backend, proxy_side) = tokio::io::duplex(256);
        let mut lines = FramedRead::new(proxy_side, LineCodec::new(1024));
        let (tx, mut rx) = mpsc::channel(8);
        let id = SessionId::new();

        backend.write_all(b"A\r\nB\r\n").await.unwrap();
        drop(backend);

        let reason = backend_to_client(&mut lines, &tx, &id).await;
        assert_eq!(reason, CloseReason::BackendClosed);
        assert_eq!(rx.recv().await, Some(Outbound::Text("A\n".into())));
        assert_eq!(rx.recv().await, Some(Outbound::Text("B\n".into())));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn backend_overlong_line_is_error() {
        let (mut backend, proxy_side) = tokio::io::duplex(256);
        let mut lines = FramedRead::new(proxy_side, LineCodec::new(4));
        let (tx, _rx) = mpsc::channel(8);

        backend.write_all(b"0123456789").await.unwrap();
        let reason = backend_to_client(&mut lines, &tx, &SessionId::new()).await;
        assert_eq!(reason, CloseReason::BackendError);
    }

    #[tokio::test]
    async fn backend_pump_stops_when_client_queue_closes() {
        let (mut backend, proxy_side) = tokio::io::duplex(256);
        let mut lines = FramedRead::new(proxy_side, LineCodec::new(1024));
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        backend.write_all(b"PING :x\r\n").await.unwrap();
        let reason = backend_to_client(&mut lines, &tx, &SessionId::new()).await;
        assert_eq!(reason, CloseReason::ClientError);
    }

    #[tokio::test]
    async fn client_messages_become_newline_terminated_lines() {
        let (proxy_side, mut backend) = tokio::io::duplex(1024);
        let mut sink = FramedWrite::new(proxy_side, LineCodec::new(1024));
        let (_monitor, client) = tracked();

        let incoming = futures::stream::iter(vec![
            text("NICK alice\r\n"),
            text("JOIN #a\r\n\r\nJOIN #b"),
            Ok(Message::Binary(bytes::Bytes::from_static(b"PART #a\n"))),
            Ok(Message::Close(None)),
            text("NEVER SENT"),
        ]);

        let reason = client_to_backend(incoming, &mut sink, &client, &SessionId::new()).await;
        assert_eq!(reason, CloseReason::ClientClosed);
        drop(sink);

        let mut received = String::new();
        let _ = backend.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "NICK alice\nJOIN #a\nJOIN #b\nPART #a\n");
    }

    #[tokio::test]
    async fn pong_marks_client_alive() {
        let (proxy_side, _backend) = tokio::io::duplex(64);
        let mut sink = FramedWrite::new(proxy_side, LineCodec::new(1024));
        let (monitor, client) = tracked();

        let _ = monitor.sweep();
        assert!(!client.is_alive());

        let incoming = futures::stream::iter(vec![Ok::<_, axum::Error>(Message::Pong(
            bytes::Bytes::new(),
        ))]);
        let reason = client_to_backend(incoming, &mut sink, &client, &SessionId::new()).await;
        assert_eq!(reason, CloseReason::ClientClosed);
        assert!(client.is_alive());
    }

    #[tokio::test]
    async fn client_stream_error_ends_pump() {
        let (proxy_side, _backend) = tokio::io::duplex(64);
        let mut sink = FramedWrite::new(proxy_side, LineCodec::new(1024));
        let (_monitor, client) = tracked();

        let incoming = futures::stream::iter(vec![Err::<Message, _>(axum::Error::new(
            std::io::Error::other("reset"),
        ))]);
        let reason = client_to_backend(incoming, &mut sink, &client, &SessionId::new()).await;
        assert_eq!(reason, CloseReason::ClientError);
    }

    #[tokio::test]
    async fn writer_sends_queue_in_order_then_close() {
        let (sink, mut sent) = fmpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel(8);
        let (_monitor, client) = tracked();

        tx.send(Outbound::Text("AUTHENTICATE\n".into())).await.unwrap();
        tx.send(Outbound::Text(":srv 001 a :hi\n".into())).await.unwrap();
        tx.send(Outbound::Close).await.unwrap();

        client_writer(sink, rx, client, SessionId::new()).await;

        assert_eq!(sent.next().await, Some(Message::Text("AUTHENTICATE\n".into())));
        assert_eq!(sent.next().await, Some(Message::Text(":srv 001 a :hi\n".into())));
        assert_eq!(sent.next().await, Some(Message::Close(None)));
        assert_eq!(sent.next().await, None);
    }

    #[tokio::test]
    async fn writer_pings_on_probe() {
        let (sink, mut sent) = fmpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel(8);
        let (monitor, client) = tracked();

        let _ = monitor.sweep();
        let writer = tokio::spawn(client_writer(sink, rx, client, SessionId::new()));

        assert!(matches!(sent.next().await, Some(Message::Ping(_))));
        drop(tx);
        writer.await.unwrap();
        assert_eq!(sent.next().await, Some(Message::Close(None)));
    }

    #[tokio::test]
    async fn writer_stops_when_sink_fails() {
        let (sink, sent) = fmpsc::unbounded::<Message>();
        drop(sent);
        let (tx, rx) = mpsc::channel(8);
        let (_monitor, client) = tracked();

        tx.send(Outbound::Text("x\n".into())).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            client_writer(sink, rx, client, SessionId::new()),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn registration_precedes_client_lines() {
        let (socket, (in_tx, mut out_rx)) = fake_socket();
        let (proxy_side, backend) = tokio::io::duplex(4096);
        let ctx = context(ProxyMode::ProtocolAware);

        // Queued before the bridge starts; must still land after registration.
        in_tx.unbounded_send(text("JOIN #rust\r\n")).unwrap();

        let reg = Registration {
            nick: "alice".into(),
            pass: Some("pw".into()),
        };
        let pre = PreRelay::for_session(Some(&reg), &ctx.config.capabilities);
        let handle = spawn_bridge(socket, proxy_side, pre, ctx);

        let mut reader = BufReader::new(backend);
        let mut got = Vec::new();
        for _ in 0..7 {
            let mut line = String::new();
            let _ = reader.read_line(&mut line).await.unwrap();
            got.push(line);
        }
        assert_eq!(
            got,
            vec![
                "CAP REQ server-time\n",
                "CAP REQ znc.in/server-time-iso\n",
                "CAP END\n",
                "PASS pw\n",
                "NICK alice\n",
                "USER alice * * :alice\n",
                "JOIN #rust\n",
            ]
        );

        drop(reader);
        assert_eq!(handle.await.unwrap(), CloseReason::BackendClosed);
        assert_eq!(out_rx.next().await, Some(Message::Close(None)));
        drop(in_tx);
    }

    #[tokio::test]
    async fn passthrough_announces_before_backend_data() {
        let (socket, (in_tx, mut out_rx)) = fake_socket();
        let (proxy_side, mut backend) = tokio::io::duplex(4096);
        let ctx = context(ProxyMode::Passthrough);

        let handle = spawn_bridge(socket, proxy_side, PreRelay::for_session(None, &[]), ctx);
        backend.write_all(b":srv NOTICE * :hello\r\n").await.unwrap();

        assert_eq!(out_rx.next().await, Some(Message::Text("AUTHENTICATE\n".into())));
        assert_eq!(
            out_rx.next().await,
            Some(Message::Text(":srv NOTICE * :hello\n".into()))
        );

        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        assert_eq!(handle.await.unwrap(), CloseReason::ClientClosed);

        // Backend sees end-of-stream once the client left.
        let mut rest = Vec::new();
        let _ = backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_both_sides() {
        let (socket, (_in_tx, mut out_rx)) = fake_socket();
        let (proxy_side, mut backend) = tokio::io::duplex(4096);
        let ctx = context(ProxyMode::Passthrough);
        let shutdown = ctx.shutdown.clone();

        let handle = spawn_bridge(socket, proxy_side, PreRelay::for_session(None, &[]), ctx);
        assert_eq!(out_rx.next().await, Some(Message::Text("AUTHENTICATE\n".into())));

        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), CloseReason::Shutdown);
        assert_eq!(out_rx.next().await, Some(Message::Close(None)));
        let mut rest = Vec::new();
        let _ = backend.read_to_end(&mut rest).await.unwrap();
    }

    #[tokio::test]
    async fn eviction_drops_client_without_close_frame() {
        let (socket, (_in_tx, mut out_rx)) = fake_socket();
        let (proxy_side, _backend) = tokio::io::duplex(4096);
        let ctx = context(ProxyMode::Passthrough);
        let monitor = Arc::clone(&ctx.monitor);

        let handle = spawn_bridge(socket, proxy_side, PreRelay::for_session(None, &[]), ctx);
        assert_eq!(out_rx.next().await, Some(Message::Text("AUTHENTICATE\n".into())));

        let _ = monitor.sweep();
        assert!(matches!(out_rx.next().await, Some(Message::Ping(_))));
        assert_eq!(monitor.sweep().evicted, 1);

        assert_eq!(handle.await.unwrap(), CloseReason::Evicted);
        assert_eq!(out_rx.next().await, None);
    }

    #[tokio::test]
    async fn client_is_probed_while_dial_is_pending() {
        let (socket, (in_tx, mut out_rx)) = fake_socket();
        let ctx = context(ProxyMode::Passthrough);
        let monitor = Arc::clone(&ctx.monitor);
        let dial = std::future::pending::<crate::error::Result<tokio::io::DuplexStream>>();
        let (handle, client) = spawn_dialing(socket, dial, PreRelay::for_session(None, &[]), ctx);

        for _ in 0..3 {
            let outcome = monitor.sweep();
            assert_eq!(outcome.evicted, 0);
            assert!(matches!(out_rx.next().await, Some(Message::Ping(_))));
            in_tx
                .unbounded_send(Ok(Message::Pong(bytes::Bytes::new())))
                .unwrap();
            wait_alive(&client).await;
        }

        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        assert_eq!(handle.await.unwrap(), CloseReason::ClientClosed);
        assert_eq!(out_rx.next().await, Some(Message::Close(None)));
    }

    #[tokio::test]
    async fn silent_client_is_evicted_during_dial() {
        let (socket, (_in_tx, mut out_rx)) = fake_socket();
        let ctx = context(ProxyMode::Passthrough);
        let monitor = Arc::clone(&ctx.monitor);
        let dial = std::future::pending::<crate::error::Result<tokio::io::DuplexStream>>();
        let (handle, _client) = spawn_dialing(socket, dial, PreRelay::for_session(None, &[]), ctx);

        let _ = monitor.sweep();
        assert!(matches!(out_rx.next().await, Some(Message::Ping(_))));
        assert_eq!(monitor.sweep().evicted, 1);

        assert_eq!(handle.await.unwrap(), CloseReason::Evicted);
        assert_eq!(out_rx.next().await, None);
    }

    #[tokio::test]
    async fn lines_sent_during_dial_follow_registration() {
        let (socket, (in_tx, _out_rx)) = fake_socket();
        let ctx = context(ProxyMode::ProtocolAware);
        let monitor = Arc::clone(&ctx.monitor);
        let (dial_tx, dial_rx) = tokio::sync::oneshot::channel::<tokio::io::DuplexStream>();
        let dial = async move { Ok::<_, crate::error::BridgeError>(dial_rx.await.unwrap()) };

        let reg = Registration {
            nick: "bob".into(),
            pass: None,
        };
        let pre = PreRelay::for_session(Some(&reg), &["multi-prefix".to_string()]);
        let (handle, client) = spawn_dialing(socket, dial, pre, ctx);

        // Messages are read in order, so once the pong has been seen the
        // text before it is held.
        let _ = monitor.sweep();
        in_tx.unbounded_send(text("JOIN #early
PRIVMSG #early :hi")).unwrap();
        in_tx
            .unbounded_send(Ok(Message::Pong(bytes::Bytes::new())))
            .unwrap();
        wait_alive(&client).await;

        let (proxy_side, backend) = tokio::io::duplex(4096);
        dial_tx.send(proxy_side).unwrap();
        in_tx.unbounded_send(text("JOIN #late")).unwrap();

        let mut reader = BufReader::new(backend);
        let mut got = Vec::new();
        for _ in 0..7 {
            let mut line = String::new();
            let _ = reader.read_line(&mut line).await.unwrap();
            got.push(line);
        }
        assert_eq!(
            got,
            vec![
                "CAP REQ multi-prefix\n",
                "CAP END\n",
                "NICK bob\n",
                "USER bob * * :bob\n",
                "JOIN #early\n",
                "PRIVMSG #early :hi\n",
                "JOIN #late\n",
            ]
        );
        drop(reader);
        assert_eq!(handle.await.unwrap(), CloseReason::BackendClosed);
    }

    #[tokio::test]
    async fn dial_failure_closes_client() {
        let (socket, (_in_tx, mut out_rx)) = fake_socket();
        let ctx = context(ProxyMode::Passthrough);
        let dial = std::future::ready(Err::<tokio::io::DuplexStream, _>(
            crate::error::BridgeError::Dial {
                target: "127.0.0.1:1".into(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            },
        ));
        let (handle, _client) = spawn_dialing(socket, dial, PreRelay::for_session(None, &[]), ctx);

        assert_eq!(handle.await.unwrap(), CloseReason::DialFailed);
        assert_eq!(out_rx.next().await, Some(Message::Close(None)));
        assert_eq!(out_rx.next().await, None);
    }

    #[tokio::test]
    async fn failed_registration_closes_client() {
        let (socket, (_in_tx, mut out_rx)) = fake_socket();
        let (proxy_side, backend) = tokio::io::duplex(64);
        drop(backend);
        let ctx = context(ProxyMode::ProtocolAware);

        let reg = Registration {
            nick: "alice".into(),
            pass: None,
        };
        let pre = PreRelay::for_session(Some(&reg), &ctx.config.capabilities);
        let handle = spawn_bridge(socket, proxy_side, pre, ctx);

        assert_eq!(handle.await.unwrap(), CloseReason::BackendError);
        assert_eq!(out_rx.next().await, Some(Message::Close(None)));
    }

    #[tokio::test]
    async fn relayed_lines_are_logged_with_direction() {
        let (logs, _guard) = wsproxy_core::logging::capture_logs();
        let id = SessionId::new();

        let (mut backend, proxy_side) = tokio::io::duplex(256);
        let mut lines = FramedRead::new(proxy_side, LineCodec::new(1024));
        let (tx, _rx) = mpsc::channel(8);
        backend.write_all(b":srv PING :1\r\n").await.unwrap();
        drop(backend);
        let _ = backend_to_client(&mut lines, &tx, &id).await;

        let (proxy_side, _backend) = tokio::io::duplex(256);
        let mut sink = FramedWrite::new(proxy_side, LineCodec::new(1024));
        let (_monitor, client) = tracked();
        let incoming = futures::stream::iter(vec![text("PONG :1\r\n")]);
        let _ = client_to_backend(incoming, &mut sink, &client, &id).await;

        let relay = logs.events_for_target(RELAY_TARGET);
        let messages: Vec<&str> = relay.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["<-- :srv PING :1", "--> PONG :1"]);
        let expected_id = id.to_string();
        assert!(relay
            .iter()
            .all(|e| e.field("session_id") == Some(expected_id.as_str())));
    }
}
