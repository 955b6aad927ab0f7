//! One live connection: bounded outbound queue, private state, and the
//! read/write loops that move frames between the socket and the queue.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use pika_core::ids::SessionId;
use pika_core::planner::Turn;
use pika_core::protocol::{Envelope, ResponseFormat};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::hub::Hub;

pub const WRITE_WAIT: Duration = Duration::from_secs(10);
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Must be shorter than [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(54);
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;
pub const SEND_QUEUE_CAPACITY: usize = 256;
/// Joins messages coalesced into one text frame.
pub const FRAME_SEPARATOR: char = '\n';

/// Transport tuning for a single session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub send_queue_capacity: usize,
    pub max_message_size: usize,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub write_wait: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: SEND_QUEUE_CAPACITY,
            max_message_size: MAX_MESSAGE_SIZE,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
            write_wait: WRITE_WAIT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Open = 1,
    Draining = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Draining => "draining",
            Self::Closed => "closed",
        })
    }
}

/// Receives every envelope decoded by a session's read loop.
///
/// Called inline on the read loop: implementations must return quickly and
/// push slow work (planner calls, action execution) onto their own tasks.
pub trait EnvelopeHandler: Send + Sync {
    fn handle(&self, session: &Arc<Session>, envelope: Envelope);
}

/// A connected client.
///
/// The outbound queue has one reader (the write loop) and any number of
/// writers; `send` never blocks.
pub struct Session {
    id: SessionId,
    tx: mpsc::Sender<Arc<String>>,
    closed: CancellationToken,
    state: AtomicU8,
    format: Mutex<ResponseFormat>,
    history: Mutex<Vec<Turn>>,
    dropped: AtomicU64,
    connected_at: DateTime<Utc>,
}

impl Session {
    /// Create a session in `Connecting` state together with the receiving
    /// end of its outbound queue.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let session = Arc::new(Self {
            id: SessionId::new(),
            tx,
            closed: CancellationToken::new(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            format: Mutex::new(ResponseFormat::default()),
            history: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
            connected_at: Utc::now(),
        });
        (session, rx)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Enqueue a pre-encoded message. Returns `false` if it was dropped
    /// because the queue is full or the session is closed.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.closed.is_cancelled() {
            tracing::debug!(session_id = %self.id, "send on closed session ignored");
            return false;
        }
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    session_id = %self.id,
                    msg_len = msg.len(),
                    dropped,
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(session_id = %self.id, "send queue closed");
                false
            }
        }
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.encode() {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "failed to encode envelope");
                false
            }
        }
    }

    /// Messages dropped because the queue was full.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn format(&self) -> ResponseFormat {
        *self.format.lock()
    }

    pub fn set_format(&self, format: ResponseFormat) {
        *self.format.lock() = format;
    }

    pub fn push_turn(&self, turn: Turn) {
        self.history.lock().push(turn);
    }

    /// Snapshot of the conversation so far.
    pub fn history(&self) -> Vec<Turn> {
        self.history.lock().clone()
    }

    /// Stop accepting sends and signal both loops to exit.
    pub fn close(&self) {
        if self.state() != SessionState::Closed {
            self.set_state(SessionState::Draining);
        }
        self.closed.cancel();
    }

    pub(crate) fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("dropped", &self.dropped_messages())
            .finish()
    }
}

/// Why a write loop stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteExit {
    Shutdown,
    QueueClosed,
    WriteFailed,
    WriteTimeout,
}

/// Why a read loop stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadExit {
    /// Peer closed the connection.
    Closed,
    /// No keepalive acknowledgement within the read deadline.
    Timeout,
    ReadFailed,
    Oversized,
    Shutdown,
}

/// Drain the outbound queue into `sink`, coalescing whatever is already
/// queued into one frame, and ping on the keepalive period.
pub async fn write_loop<W>(
    mut sink: W,
    mut rx: mpsc::Receiver<Arc<String>>,
    closed: CancellationToken,
    config: SessionConfig,
    session_id: SessionId,
) -> WriteExit
where
    W: Sink<WsMessage> + Unpin,
    W::Error: fmt::Display,
{
    let mut ping = tokio::time::interval_at(Instant::now() + config.ping_period, config.ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            biased;
            msg = rx.recv() => {
                let Some(first) = msg else {
                    break WriteExit::QueueClosed;
                };
                let mut frame = String::from(first.as_str());
                let pending = rx.len();
                for _ in 0..pending {
                    match rx.try_recv() {
                        Ok(next) => {
                            frame.push(FRAME_SEPARATOR);
                            frame.push_str(&next);
                        }
                        Err(_) => break,
                    }
                }
                if let Some(exit) =
                    write_frame(&mut sink, WsMessage::Text(frame.into()), config.write_wait, &session_id).await
                {
                    break exit;
                }
            }
            _ = ping.tick() => {
                if let Some(exit) =
                    write_frame(&mut sink, WsMessage::Ping(Vec::new().into()), config.write_wait, &session_id).await
                {
                    break exit;
                }
                tracing::trace!(session_id = %session_id, "sent ping");
            }
            _ = closed.cancelled() => break WriteExit::Shutdown,
        }
    };

    if matches!(exit, WriteExit::Shutdown | WriteExit::QueueClosed) {
        let _ = tokio::time::timeout(config.write_wait, sink.send(WsMessage::Close(None))).await;
    }
    exit
}

async fn write_frame<W>(
    sink: &mut W,
    message: WsMessage,
    write_wait: Duration,
    session_id: &SessionId,
) -> Option<WriteExit>
where
    W: Sink<WsMessage> + Unpin,
    W::Error: fmt::Display,
{
    match tokio::time::timeout(write_wait, sink.send(message)).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            tracing::debug!(session_id = %session_id, error = %e, "write failed");
            Some(WriteExit::WriteFailed)
        }
        Err(_) => {
            tracing::debug!(session_id = %session_id, "write timed out");
            Some(WriteExit::WriteTimeout)
        }
    }
}

/// Read frames until the peer goes away, the read deadline passes, or the
/// session is closed. Every pong pushes the deadline out by `pong_wait`.
pub async fn read_loop<R, E>(
    mut stream: R,
    session: Arc<Session>,
    handler: Arc<dyn EnvelopeHandler>,
    config: SessionConfig,
) -> ReadExit
where
    R: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: fmt::Display,
{
    let closed = session.close_token();
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => return ReadExit::Shutdown,
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };
        let msg = match next {
            Err(_) => {
                tracing::info!(session_id = %session.id(), "read deadline exceeded");
                return ReadExit::Timeout;
            }
            Ok(None) => return ReadExit::Closed,
            Ok(Some(Err(e))) => {
                tracing::debug!(session_id = %session.id(), error = %e, "read failed");
                return ReadExit::ReadFailed;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            WsMessage::Text(text) => {
                let text = text.as_str();
                if text.len() > config.max_message_size {
                    tracing::warn!(session_id = %session.id(), len = text.len(), "frame exceeds size limit");
                    return ReadExit::Oversized;
                }
                dispatch_frame(&session, handler.as_ref(), text);
            }
            WsMessage::Binary(bytes) => {
                if bytes.len() > config.max_message_size {
                    tracing::warn!(session_id = %session.id(), len = bytes.len(), "frame exceeds size limit");
                    return ReadExit::Oversized;
                }
                match std::str::from_utf8(&bytes) {
                    Ok(text) => dispatch_frame(&session, handler.as_ref(), text),
                    Err(e) => {
                        tracing::warn!(session_id = %session.id(), error = %e, "dropping non-utf8 frame");
                    }
                }
            }
            WsMessage::Pong(_) => {
                deadline = Instant::now() + config.pong_wait;
            }
            // axum answers pings itself
            WsMessage::Ping(_) => {}
            WsMessage::Close(_) => return ReadExit::Closed,
        }
    }
}

fn dispatch_frame(session: &Arc<Session>, handler: &dyn EnvelopeHandler, raw: &str) {
    let envelope = match Envelope::decode(raw) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!(session_id = %session.id(), error = %e, "invalid message format");
            return;
        }
    };
    if let Some(format) = envelope.format {
        session.set_format(format);
    }
    handler.handle(session, envelope);
}

/// Drive a registered session until either loop exits, then tear both down
/// and remove the session from the hub.
pub async fn run<W, R, E>(
    session: Arc<Session>,
    rx: mpsc::Receiver<Arc<String>>,
    sink: W,
    stream: R,
    hub: Arc<Hub>,
    handler: Arc<dyn EnvelopeHandler>,
    config: SessionConfig,
) where
    W: Sink<WsMessage> + Unpin + Send + 'static,
    W::Error: fmt::Display,
    R: Stream<Item = Result<WsMessage, E>> + Unpin + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let _ = hub.register(Arc::clone(&session));
    session.set_state(SessionState::Open);
    tracing::info!(session_id = %session.id(), clients = hub.client_count(), "client connected");

    let _ = session.send_envelope(&Envelope::idle());

    let mut writer = tokio::spawn(write_loop(
        sink,
        rx,
        session.close_token(),
        config.clone(),
        session.id().clone(),
    ));
    let mut reader = tokio::spawn(read_loop(
        stream,
        Arc::clone(&session),
        handler,
        config.clone(),
    ));

    let survivor = tokio::select! {
        exit = &mut writer => {
            tracing::debug!(session_id = %session.id(), ?exit, "write loop finished");
            Survivor::Reader(reader)
        }
        exit = &mut reader => {
            tracing::debug!(session_id = %session.id(), ?exit, "read loop finished");
            Survivor::Writer(writer)
        }
    };

    let _ = hub.unregister(session.id());
    session.close();
    match survivor {
        Survivor::Reader(handle) => finish(handle, config.write_wait).await,
        Survivor::Writer(handle) => finish(handle, config.write_wait).await,
    }
    session.set_state(SessionState::Closed);

    tracing::info!(
        session_id = %session.id(),
        dropped = session.dropped_messages(),
        clients = hub.client_count(),
        "client disconnected"
    );
}

enum Survivor {
    Reader(JoinHandle<ReadExit>),
    Writer(JoinHandle<WriteExit>),
}

async fn finish<T>(mut handle: JoinHandle<T>, wait: Duration) {
    if tokio::time::timeout(wait, &mut handle).await.is_err() {
        handle.abort();
    }
}

/// Serve an upgraded WebSocket as a new session.
pub async fn serve(
    socket: WebSocket,
    hub: Arc<Hub>,
    handler: Arc<dyn EnvelopeHandler>,
    config: SessionConfig,
) {
    let (session, rx) = Session::new(config.send_queue_capacity);
    let (sink, stream) = socket.split();
    run(session, rx, sink, stream, hub, handler, config).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use pika_core::protocol::MessageType;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Envelope>>,
    }

    impl EnvelopeHandler for Recorder {
        fn handle(&self, _session: &Arc<Session>, envelope: Envelope) {
            self.seen.lock().push(envelope);
        }
    }

    fn text(s: &str) -> WsMessage {
        WsMessage::Text(s.to_string().into())
    }

    fn frame_text(msg: &WsMessage) -> String {
        match msg {
            WsMessage::Text(t) => t.as_str().to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn new_session_starts_connecting() {
        let (session, _rx) = Session::new(4);
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.id().as_str().starts_with("sess_"));
        assert_eq!(session.format(), ResponseFormat::Htmx);
        assert!(session.history().is_empty());
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (session, mut rx) = Session::new(2);
        assert!(session.send(Arc::new("a".into())));
        assert!(session.send(Arc::new("b".into())));
        assert!(!session.send(Arc::new("c".into())));
        assert!(!session.send(Arc::new("d".into())));
        assert_eq!(session.dropped_messages(), 2);

        assert_eq!(rx.try_recv().unwrap().as_str(), "a");
        assert_eq!(rx.try_recv().unwrap().as_str(), "b");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_after_close_is_a_noop() {
        let (session, mut rx) = Session::new(4);
        session.close();
        assert_eq!(session.state(), SessionState::Draining);
        assert!(!session.send(Arc::new("late".into())));
        assert!(rx.try_recv().is_err());
        assert_eq!(session.dropped_messages(), 0);
    }

    #[test]
    fn send_after_write_loop_gone_is_a_noop() {
        let (session, rx) = Session::new(4);
        drop(rx);
        assert!(!session.send_envelope(&Envelope::idle()));
    }

    #[test]
    fn history_is_append_only_snapshot() {
        let (session, _rx) = Session::new(4);
        session.push_turn(Turn::user("hi"));
        let snapshot = session.history();
        session.push_turn(Turn::assistant("hello"));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(session.history().len(), 2);
    }

    #[tokio::test]
    async fn write_loop_coalesces_queued_messages() {
        let (session, rx) = Session::new(8);
        for m in ["one", "two", "three"] {
            session.send(Arc::new(m.into()));
        }
        let (sink, mut frames) = fmpsc::unbounded::<WsMessage>();
        let token = session.close_token();
        let handle = tokio::spawn(write_loop(
            sink,
            rx,
            token,
            SessionConfig::default(),
            session.id().clone(),
        ));

        let first = frames.next().await.unwrap();
        assert_eq!(frame_text(&first), "one\ntwo\nthree");

        session.close();
        assert_eq!(handle.await.unwrap(), WriteExit::Shutdown);
        assert!(matches!(frames.next().await, Some(WsMessage::Close(None))));
    }

    #[tokio::test(start_paused = true)]
    async fn write_loop_pings_on_period() {
        let (session, rx) = Session::new(8);
        let (sink, mut frames) = fmpsc::unbounded::<WsMessage>();
        let config = SessionConfig {
            ping_period: Duration::from_secs(5),
            ..Default::default()
        };
        let handle = tokio::spawn(write_loop(sink, rx, session.close_token(), config, session.id().clone()));

        let start = Instant::now();
        assert!(matches!(frames.next().await, Some(WsMessage::Ping(_))));
        assert!(start.elapsed() >= Duration::from_secs(5));

        session.close();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn write_loop_stops_on_write_failure() {
        let (session, rx) = Session::new(8);
        let (sink, frames) = fmpsc::unbounded::<WsMessage>();
        drop(frames);
        session.send(Arc::new("x".into()));
        let exit = write_loop(sink, rx, session.close_token(), SessionConfig::default(), session.id().clone()).await;
        assert_eq!(exit, WriteExit::WriteFailed);
    }

    #[tokio::test]
    async fn read_loop_drops_garbage_and_updates_format() {
        let (session, _rx) = Session::new(8);
        let recorder = Arc::new(Recorder::default());
        let (tx, stream) = fmpsc::unbounded::<Result<WsMessage, String>>();

        tx.unbounded_send(Ok(text("{not json"))).unwrap();
        tx.unbounded_send(Ok(text(
            r#"{"type":"command","payload":{"text":"hi"},"format":"json"}"#,
        )))
        .unwrap();
        drop(tx);

        let exit = read_loop(stream, Arc::clone(&session), recorder.clone(), SessionConfig::default()).await;
        assert_eq!(exit, ReadExit::Closed);

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, MessageType::Command);
        assert_eq!(session.format(), ResponseFormat::Json);
    }

    #[tokio::test]
    async fn read_loop_keeps_frames_with_empty_or_unknown_format() {
        let (session, _rx) = Session::new(8);
        let recorder = Arc::new(Recorder::default());
        let (tx, stream) = fmpsc::unbounded::<Result<WsMessage, String>>();

        tx.unbounded_send(Ok(text(
            r#"{"type":"command","payload":{"text":"hi"},"request_id":"r","format":""}"#,
        )))
        .unwrap();
        tx.unbounded_send(Ok(text(
            r#"{"type":"command","payload":{"text":"hi"},"format":"html"}"#,
        )))
        .unwrap();
        drop(tx);

        let exit = read_loop(stream, Arc::clone(&session), recorder.clone(), SessionConfig::default()).await;
        assert_eq!(exit, ReadExit::Closed);

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].request_id.as_str(), "r");
        assert!(seen.iter().all(|env| env.format.is_none()));
        assert_eq!(session.format(), ResponseFormat::Htmx);
    }

    #[tokio::test]
    async fn read_loop_accepts_utf8_binary_frames() {
        let (session, _rx) = Session::new(8);
        let recorder = Arc::new(Recorder::default());
        let (tx, stream) = fmpsc::unbounded::<Result<WsMessage, String>>();
        let raw = br#"{"type":"status","payload":{}}"#.to_vec();
        tx.unbounded_send(Ok(WsMessage::Binary(raw.into()))).unwrap();
        tx.unbounded_send(Ok(WsMessage::Close(None))).unwrap();

        let exit = read_loop(stream, session, recorder.clone(), SessionConfig::default()).await;
        assert_eq!(exit, ReadExit::Closed);
        assert_eq!(recorder.seen.lock()[0].kind, MessageType::Status);
    }

    #[tokio::test]
    async fn read_loop_rejects_oversized_frames() {
        let (session, _rx) = Session::new(8);
        let (tx, stream) = fmpsc::unbounded::<Result<WsMessage, String>>();
        tx.unbounded_send(Ok(text(&"x".repeat(64)))).unwrap();
        let config = SessionConfig {
            max_message_size: 16,
            ..Default::default()
        };
        let exit = read_loop(stream, session, Arc::new(Recorder::default()), config).await;
        assert_eq!(exit, ReadExit::Oversized);
    }

    #[tokio::test]
    async fn read_loop_stops_on_transport_error() {
        let (session, _rx) = Session::new(8);
        let (tx, stream) = fmpsc::unbounded::<Result<WsMessage, String>>();
        tx.unbounded_send(Err("connection reset".into())).unwrap();
        let exit = read_loop(stream, session, Arc::new(Recorder::default()), SessionConfig::default()).await;
        assert_eq!(exit, ReadExit::ReadFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn read_deadline_expires_without_pong() {
        let (session, _rx) = Session::new(8);
        let stream = futures::stream::pending::<Result<WsMessage, String>>();
        let start = Instant::now();
        let exit = read_loop(stream, session, Arc::new(Recorder::default()), SessionConfig::default()).await;
        assert_eq!(exit, ReadExit::Timeout);
        assert!(start.elapsed() >= PONG_WAIT);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_refreshes_read_deadline() {
        let (session, _rx) = Session::new(8);
        let (tx, stream) = fmpsc::unbounded::<Result<WsMessage, String>>();
        let start = Instant::now();
        let handle = tokio::spawn(read_loop(
            stream,
            session,
            Arc::new(Recorder::default()),
            SessionConfig::default(),
        ));

        tokio::time::sleep(Duration::from_secs(50)).await;
        tx.unbounded_send(Ok(WsMessage::Pong(Vec::new().into()))).unwrap();
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(!handle.is_finished());

        assert_eq!(handle.await.unwrap(), ReadExit::Timeout);
        assert!(start.elapsed() >= Duration::from_secs(110));
    }

    #[tokio::test]
    async fn read_loop_exits_on_close() {
        let (session, _rx) = Session::new(8);
        let stream = futures::stream::pending::<Result<WsMessage, String>>();
        let handle = tokio::spawn(read_loop(
            stream,
            Arc::clone(&session),
            Arc::new(Recorder::default()),
            SessionConfig::default(),
        ));
        session.close();
        assert_eq!(handle.await.unwrap(), ReadExit::Shutdown);
    }

    #[tokio::test]
    async fn run_registers_greets_and_tears_down() {
        let hub = Arc::new(Hub::new());
        let (session, rx) = Session::new(8);
        let (sink, mut frames) = fmpsc::unbounded::<WsMessage>();
        let (inbound, stream) = fmpsc::unbounded::<Result<WsMessage, String>>();

        let task = tokio::spawn(run(
            Arc::clone(&session),
            rx,
            sink,
            stream,
            Arc::clone(&hub),
            Arc::new(Recorder::default()),
            SessionConfig::default(),
        ));

        let greeting = frames.next().await.unwrap();
        let env = Envelope::decode(&frame_text(&greeting)).unwrap();
        assert_eq!(env.kind, MessageType::Status);
        assert_eq!(env.payload["status"], "idle");
        assert_eq!(hub.client_count(), 1);
        assert_eq!(session.state(), SessionState::Open);

        // Peer disconnects: both loops must stop and the hub must forget it.
        drop(inbound);
        task.await.unwrap();
        assert_eq!(hub.client_count(), 0);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.send(Arc::new("after".into())));
    }

    #[tokio::test]
    async fn run_ends_when_hub_unregisters() {
        let hub = Arc::new(Hub::new());
        let (session, rx) = Session::new(8);
        let (sink, mut frames) = fmpsc::unbounded::<WsMessage>();
        let (_inbound, stream) = fmpsc::unbounded::<Result<WsMessage, String>>();

        let task = tokio::spawn(run(
            Arc::clone(&session),
            rx,
            sink,
            stream,
            Arc::clone(&hub),
            Arc::new(Recorder::default()),
            SessionConfig::default(),
        ));
        let _greeting = frames.next().await.unwrap();

        assert!(hub.unregister(session.id()).is_some());
        task.await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
