//! Ship-side link session: the single long-lived TCP connection to the
//! offshore relay, and the stream state machine shared by both endpoints.
//!
//! The session owns the socket; streams are a relation to it, not owners of
//! any socket resource. When the link dies, every in-flight stream operation
//! fails fast with [`LinkError::Down`] and the next stream triggers a
//! reconnect with bounded exponential backoff.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc},
    time::{sleep, timeout},
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{debug, info};

use crate::frame::{Frame, FrameError, FrameKind, MAX_PAYLOAD, StreamKind, write_frame};

/// Errors surfaced by link and stream operations on the ship side.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link is down")]
    Down,

    #[error("no frame received within the idle timeout")]
    IdleTimeout,

    #[error("unexpected {0:?} frame from the peer")]
    UnexpectedFrame(FrameKind),

    #[error(transparent)]
    Protocol(#[from] FrameError),

    #[error("i/o error on link")]
    Io(#[from] std::io::Error),
}

/// Stream lifecycle states, identical on both endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    RequestSent,
    Responding,
    Tunneling,
    HalfClosed,
    Closed,
}

/// Edges of the stream state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamEvent {
    /// `OPEN` emitted or received.
    Opened,
    /// The full request (head, body, `EOF_C2S`) or the CONNECT target has
    /// been forwarded.
    RequestForwarded,
    /// First `DATA_S2C` of a REQUEST stream.
    ResponseBegan,
    /// Tunnel-ready signal exchanged after the origin connected.
    TunnelEstablished,
    /// One direction signalled EOF.
    Eof,
    /// The worker released a stream whose remaining direction was done.
    Retired,
    /// `CLOSE` or `ERROR` forced the stream down.
    Terminated,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        self == StreamState::Closed
    }

    fn advance(self, event: StreamEvent) -> Option<StreamState> {
        use StreamEvent as E;
        use StreamState as S;
        match (self, event) {
            (S::Idle, E::Opened) => Some(S::Open),
            (S::Open, E::RequestForwarded) => Some(S::RequestSent),
            (S::RequestSent, E::ResponseBegan) => Some(S::Responding),
            (S::RequestSent, E::TunnelEstablished) => Some(S::Tunneling),
            (S::Responding | S::Tunneling, E::Eof) => Some(S::HalfClosed),
            (S::HalfClosed, E::Eof | E::Retired) => Some(S::Closed),
            (state, E::Terminated) if state != S::Closed => Some(S::Closed),
            _ => None,
        }
    }
}

/// A transition the state machine does not allow; treated as a protocol
/// error by both endpoints.
#[derive(Debug, thiserror::Error)]
#[error("invalid stream transition from {from:?} on {event:?}")]
pub(crate) struct InvalidTransition {
    from: StreamState,
    event: StreamEvent,
}

/// One logical bidirectional byte channel over the link.
#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) id: u32,
    pub(crate) kind: StreamKind,
    state: StreamState,
}

impl Stream {
    pub(crate) fn new(id: u32, kind: StreamKind) -> Self {
        Self {
            id,
            kind,
            state: StreamState::Idle,
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    pub(crate) fn advance(&mut self, event: StreamEvent) -> Result<StreamState, InvalidTransition> {
        match self.state.advance(event) {
            Some(next) => {
                self.state = next;
                Ok(next)
            }
            None => Err(InvalidTransition {
                from: self.state,
                event,
            }),
        }
    }
}

/// How one direction of a tunnel pump finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpEnd {
    /// Clean half-close of this direction.
    Eof,
    /// The stream was forced down (`CLOSE`, `ERROR`, or a socket error).
    Terminated,
    /// The link itself died.
    LinkDown,
    /// The opposite pump requested a stop.
    Stopped,
}

/// Tunables for the ship's link maintenance.
#[derive(Debug, Clone)]
pub struct LinkOpts {
    /// Timeout for one connection attempt to the offshore relay.
    pub connect_timeout: Duration,
    /// First reconnect delay; doubles per failed attempt.
    pub initial_backoff: Duration,
    /// Reconnect delay ceiling.
    pub max_backoff: Duration,
    /// Frame payload cap enforced by the reader.
    pub max_payload: usize,
}

impl Default for LinkOpts {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
            max_payload: MAX_PAYLOAD,
        }
    }
}

struct ActiveStream {
    id: u32,
    tx: mpsc::Sender<Frame>,
}

struct LinkConn {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    down: CancellationToken,
    next_stream_id: u32,
    _reader: AbortOnDropHandle<()>,
}

/// The singleton owning the ship's one outbound connection.
pub struct LinkSession {
    server_addr: String,
    opts: LinkOpts,
    conn: Mutex<Option<LinkConn>>,
    active: Arc<StdMutex<Option<ActiveStream>>>,
}

impl LinkSession {
    pub fn new(server_addr: impl Into<String>, opts: LinkOpts) -> Self {
        Self {
            server_addr: server_addr.into(),
            opts,
            conn: Mutex::new(None),
            active: Arc::new(StdMutex::new(None)),
        }
    }

    /// Opens the next stream on the link, reconnecting first if necessary.
    ///
    /// Blocks until the link is up and the `OPEN` frame is on the wire; the
    /// caller must drive the stream to a terminal state and then call
    /// [`LinkSession::retire`]. Stream ids restart at 1 on every reconnect.
    pub async fn begin_stream(
        &self,
        kind: StreamKind,
        target: &str,
    ) -> Result<StreamHandle, LinkError> {
        loop {
            let (writer, down, id) = self.ensure().await;
            let (tx, rx) = mpsc::channel(32);
            *self.active.lock().unwrap() = Some(ActiveStream { id, tx });
            let handle = StreamHandle {
                sender: StreamSender {
                    id,
                    writer,
                    down: down.clone(),
                },
                receiver: StreamReceiver { rx, down },
            };
            match handle.sender.send(Frame::open(id, kind, target)).await {
                Ok(()) => return Ok(handle),
                Err(LinkError::Down | LinkError::Io(_)) => {
                    debug!(stream = id, "link died while opening stream, reconnecting");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Clears the active-stream slot so late frames for `id` are dropped by
    /// the reader.
    pub fn retire(&self, id: u32) {
        let mut slot = self.active.lock().unwrap();
        if slot.as_ref().is_some_and(|active| active.id == id) {
            *slot = None;
        }
    }

    /// Returns a live connection, dialing with backoff until one exists.
    async fn ensure(&self) -> (Arc<Mutex<OwnedWriteHalf>>, CancellationToken, u32) {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_mut() {
            if !conn.down.is_cancelled() {
                let id = conn.next_stream_id;
                conn.next_stream_id += 1;
                return (conn.writer.clone(), conn.down.clone(), id);
            }
            *guard = None;
        }

        let mut delay = self.opts.initial_backoff;
        loop {
            match timeout(
                self.opts.connect_timeout,
                TcpStream::connect(&self.server_addr),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true).ok();
                    info!(server = %self.server_addr, "link established");
                    let (read_half, write_half) = stream.into_split();
                    let down = CancellationToken::new();
                    let reader = AbortOnDropHandle::new(tokio::spawn(read_loop(
                        read_half,
                        self.active.clone(),
                        down.clone(),
                        self.opts.max_payload,
                    )));
                    let writer = Arc::new(Mutex::new(write_half));
                    *guard = Some(LinkConn {
                        writer: writer.clone(),
                        down: down.clone(),
                        next_stream_id: 2,
                        _reader: reader,
                    });
                    return (writer, down, 1);
                }
                Ok(Err(err)) => {
                    debug!(server = %self.server_addr, %err, ?delay, "offshore connect failed, backing off");
                }
                Err(_) => {
                    debug!(server = %self.server_addr, ?delay, "offshore connect timed out, backing off");
                }
            }
            sleep(delay).await;
            delay = (delay * 2).min(self.opts.max_backoff);
        }
    }
}

/// Decodes frames off the link and routes them to the active stream.
///
/// Frames whose stream id does not match the active stream are dropped; any
/// read or protocol error takes the whole link down.
async fn read_loop(
    mut reader: OwnedReadHalf,
    active: Arc<StdMutex<Option<ActiveStream>>>,
    down: CancellationToken,
    max_payload: usize,
) {
    loop {
        match Frame::read_from(&mut reader, max_payload).await {
            Ok(frame) => {
                let tx = active
                    .lock()
                    .unwrap()
                    .as_ref()
                    .filter(|stream| stream.id == frame.stream)
                    .map(|stream| stream.tx.clone());
                match tx {
                    Some(tx) => {
                        if tx.send(frame).await.is_err() {
                            debug!("active stream receiver dropped, discarding frame");
                        }
                    }
                    None => {
                        debug!(stream = frame.stream, kind = ?frame.kind, "dropping frame for retired stream")
                    }
                }
            }
            Err(err) => {
                debug!(%err, "link read loop ended");
                down.cancel();
                return;
            }
        }
    }
}

/// Handle for the single active stream, split so a tunnel's two byte pumps
/// can run concurrently against one stream.
pub struct StreamHandle {
    pub(crate) sender: StreamSender,
    pub(crate) receiver: StreamReceiver,
}

impl StreamHandle {
    pub(crate) fn id(&self) -> u32 {
        self.sender.id
    }
}

/// Frame-emitting half of a stream handle. Cloneable; every send goes
/// through the link's one writer mutex, so frames never interleave.
#[derive(Clone)]
pub(crate) struct StreamSender {
    id: u32,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    down: CancellationToken,
}

impl StreamSender {
    pub(crate) async fn send(&self, frame: Frame) -> Result<(), LinkError> {
        if self.down.is_cancelled() {
            return Err(LinkError::Down);
        }
        let mut writer = self.writer.lock().await;
        match write_frame(&mut *writer, &frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.down.cancel();
                Err(LinkError::Io(err))
            }
        }
    }

    /// Marks the link as broken, e.g. after a protocol violation.
    pub(crate) fn poison(&self) {
        self.down.cancel();
    }
}

/// Frame-consuming half of a stream handle.
pub(crate) struct StreamReceiver {
    rx: mpsc::Receiver<Frame>,
    down: CancellationToken,
}

impl StreamReceiver {
    /// Waits for the next inbound frame of this stream.
    ///
    /// Frames already routed before a link failure are still delivered;
    /// afterwards this returns [`LinkError::Down`]. With an idle timeout
    /// set, a quiet period returns [`LinkError::IdleTimeout`].
    pub(crate) async fn recv(&mut self, idle_timeout: Option<Duration>) -> Result<Frame, LinkError> {
        let next = async {
            tokio::select! {
                biased;
                frame = self.rx.recv() => frame.ok_or(LinkError::Down),
                _ = self.down.cancelled() => Err(LinkError::Down),
            }
        };
        match idle_timeout {
            Some(window) => timeout(window, next)
                .await
                .map_err(|_| LinkError::IdleTimeout)?,
            None => next.await,
        }
    }
}
