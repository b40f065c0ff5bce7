//! Offshore dispatcher: accepts the single link from the ship,
//! reconstitutes requests from frames, dials origins, and streams results
//! back.
//!
//! Exactly one link is served at a time; a newly accepted connection
//! supersedes the previous one. Per link, a single-threaded reader
//! dispatches frames to the active stream task and a dedicated writer task
//! serialises outbound frames, so frames never interleave on the wire even
//! when a stream is aborted mid-flight.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderValue, header};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, info, warn};

use crate::{
    frame::{DATA_CHUNK, Frame, FrameKind, MAX_PAYLOAD, StreamKind, write_frame},
    link::{InvalidTransition, PumpEnd, Stream, StreamEvent},
    parse::{
        Authority, ParseError, RequestHead, ResponseHead, has_header_token, next_body_chunk,
        split_absolute_target, strip_hop_by_hop, ensure_host,
    },
    util::BufferedReader,
};

/// Tunables for the offshore dispatcher.
#[derive(Debug, Clone)]
pub struct OffshoreOpts {
    /// Frame payload cap enforced by the reader.
    pub max_payload: usize,
    /// Cap on the accumulated bytes of one marshalled request.
    pub request_buffer_max: usize,
    /// Timeout for dialing an origin.
    pub origin_connect_timeout: Duration,
}

impl Default for OffshoreOpts {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD,
            request_buffer_max: 16 * 1024 * 1024,
            origin_connect_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum StreamError {
    #[error("{0}")]
    Origin(String),

    #[error("malformed request on stream")]
    Parse(#[from] ParseError),

    #[error("request exceeds the buffer cap")]
    RequestTooLarge,

    #[error("unexpected {0:?} frame from the ship")]
    UnexpectedFrame(FrameKind),

    #[error("link closed")]
    LinkGone,

    #[error(transparent)]
    State(#[from] InvalidTransition),
}

/// The offshore-side proxy: owns the listening socket for the single link.
pub struct OffshoreProxy {
    opts: OffshoreOpts,
}

impl OffshoreProxy {
    pub fn new(opts: OffshoreOpts) -> Self {
        Self { opts }
    }

    /// Serves link connections from `listener` until `shutdown` fires.
    ///
    /// Only one link is live at a time: accepting a new one cancels the
    /// previous link and aborts its active stream.
    pub async fn run(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let mut current: Option<(CancellationToken, JoinHandle<()>)> = None;
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (socket, peer) = accepted?;
            info!(%peer, "link connected");
            if let Some((cancel, task)) = current.take() {
                debug!("superseding previous link");
                cancel.cancel();
                task.await.ok();
            }
            let cancel = CancellationToken::new();
            let task = tokio::spawn(
                serve_link(socket, self.opts.clone(), cancel.clone())
                    .instrument(error_span!("link", %peer)),
            );
            current = Some((cancel, task));
        }
        if let Some((cancel, task)) = current.take() {
            cancel.cancel();
            task.await.ok();
        }
        Ok(())
    }
}

struct ActiveStream {
    id: u32,
    tx: mpsc::Sender<Frame>,
    task: JoinHandle<()>,
}

/// Reads frames off one link and dispatches them to the active stream.
async fn serve_link(socket: TcpStream, opts: OffshoreOpts, cancel: CancellationToken) {
    socket.set_nodelay(true).ok();
    let (mut link_reader, mut link_writer) = socket.into_split();

    // one writer task serialises all outbound frames, so aborting a stream
    // can never leave a partial frame on the wire
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(64);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(err) = write_frame(&mut link_writer, &frame).await {
                debug!(%err, "link write failed");
                break;
            }
        }
    });

    let mut active: Option<ActiveStream> = None;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = Frame::read_from(&mut link_reader, opts.max_payload) => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%err, "link closed");
                break;
            }
        };
        match frame.kind {
            FrameKind::Open => {
                if let Some(previous) = active.take() {
                    // the ship only opens a stream after the previous one is
                    // terminal on its side; drop whatever is left of ours
                    debug!(stream = previous.id, "aborting superseded stream");
                    previous.task.abort();
                }
                let id = frame.stream;
                let (kind, target) = match frame.decode_open() {
                    Ok(open) => open,
                    Err(err) => {
                        warn!(stream = id, %err, "malformed OPEN, tearing down link");
                        break;
                    }
                };
                let (tx, rx) = mpsc::channel(32);
                let task = tokio::spawn(
                    run_stream(id, kind, target, rx, out_tx.clone(), opts.clone())
                        .instrument(error_span!("stream", id)),
                );
                active = Some(ActiveStream { id, tx, task });
            }
            _ => match &active {
                Some(stream) if stream.id == frame.stream => {
                    // a closed channel means the stream task already ended;
                    // stay responsive to cancellation while backpressured
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = stream.tx.send(frame) => {}
                    }
                }
                _ => {
                    debug!(stream = frame.stream, kind = ?frame.kind, "dropping frame for inactive stream")
                }
            },
        }
    }

    // link gone: abort the active stream, dropping its origin socket
    if let Some(stream) = active.take() {
        stream.task.abort();
    }
    writer_task.abort();
}

async fn run_stream(
    id: u32,
    kind: StreamKind,
    target: String,
    mut rx: mpsc::Receiver<Frame>,
    out: mpsc::Sender<Frame>,
    opts: OffshoreOpts,
) {
    let mut stream = Stream::new(id, kind);
    let result = match kind {
        StreamKind::Request => request_stream(&mut stream, &mut rx, &out, &opts).await,
        StreamKind::Tunnel => tunnel_stream(&mut stream, &target, &mut rx, &out, &opts).await,
    };
    match result {
        Ok(()) => debug!(kind = ?stream.kind, state = ?stream.state(), "stream finished"),
        Err(StreamError::LinkGone) => debug!("stream abandoned, link gone"),
        Err(err) => {
            debug!(%err, "stream failed");
            if !stream.state().is_terminal() {
                out.send(Frame::error(id, 502, &err.to_string())).await.ok();
            }
        }
    }
}

/// Reconstitutes one marshalled HTTP request, performs it against the
/// origin, and streams the response back as frames.
async fn request_stream(
    stream: &mut Stream,
    rx: &mut mpsc::Receiver<Frame>,
    out: &mpsc::Sender<Frame>,
    opts: &OffshoreOpts,
) -> Result<(), StreamError> {
    stream.advance(StreamEvent::Opened)?;
    let id = stream.id;

    // the ship sends head, body, then EOF_C2S before expecting any response
    let mut request = BytesMut::new();
    loop {
        let Some(frame) = rx.recv().await else {
            return Err(StreamError::LinkGone);
        };
        match frame.kind {
            FrameKind::DataC2s => {
                if request.len() + frame.payload.len() > opts.request_buffer_max {
                    return Err(StreamError::RequestTooLarge);
                }
                request.extend_from_slice(&frame.payload);
            }
            FrameKind::EofC2s => break,
            FrameKind::Close | FrameKind::Error => {
                stream.advance(StreamEvent::Terminated)?;
                return Ok(());
            }
            other => return Err(StreamError::UnexpectedFrame(other)),
        }
    }
    stream.advance(StreamEvent::RequestForwarded)?;

    let request = request.freeze();
    let Some((head_len, mut head)) = RequestHead::parse(&request)? else {
        return Err(ParseError::UnexpectedEof.into());
    };
    let body = request.slice(head_len..);
    let (authority, path) = split_absolute_target(&head.target)?;
    debug!(method = %head.method, %authority, %path, "dialing origin");

    let had_body_framing = head.headers.contains_key(header::CONTENT_LENGTH)
        || has_header_token(&head.headers, header::TRANSFER_ENCODING, "chunked");
    strip_hop_by_hop(&mut head.headers);
    ensure_host(&mut head.headers, &authority);
    head.headers.remove(header::CONTENT_LENGTH);
    if !body.is_empty() || had_body_framing {
        head.headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    }
    // origin sockets are never reused; let the origin end the connection
    head.headers
        .insert(header::CONNECTION, HeaderValue::from_static("close"));

    let origin = dial_origin(&authority, opts).await?;
    let (origin_read, mut origin_write) = origin.into_split();
    let origin_err = |what: &'static str| {
        move |err: std::io::Error| StreamError::Origin(format!("origin {what} failed: {err}"))
    };
    origin_write
        .write_all(&head.encode(&path))
        .await
        .map_err(origin_err("write"))?;
    if !body.is_empty() {
        origin_write.write_all(&body).await.map_err(origin_err("write"))?;
    }
    origin_write.flush().await.map_err(origin_err("write"))?;

    let mut origin_reader = BufferedReader::new(origin_read);
    let mut response = ResponseHead::read(&mut origin_reader)
        .await
        .map_err(|err| StreamError::Origin(format!("origin response invalid: {err}")))?;
    let body_mode = response.body_mode(&head.method)?;
    debug!(status = %response.status, ?body_mode, "origin responded");

    strip_hop_by_hop(&mut response.headers);
    response
        .headers
        .insert(header::CONNECTION, HeaderValue::from_static("close"));

    for chunk in response.encode().chunks(DATA_CHUNK) {
        out.send(Frame::data_s2c(id, Bytes::copy_from_slice(chunk)))
            .await
            .map_err(|_| StreamError::LinkGone)?;
    }
    stream.advance(StreamEvent::ResponseBegan)?;

    // chunked bodies are decoded here; only de-chunked bytes cross the link
    let mut body_state = body_mode.reader_state();
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                None => return Err(StreamError::LinkGone),
                Some(frame) if matches!(frame.kind, FrameKind::Close | FrameKind::Error) => {
                    stream.advance(StreamEvent::Terminated)?;
                    return Ok(());
                }
                Some(_) => {}
            },
            chunk = next_body_chunk(&mut origin_reader, &mut body_state, DATA_CHUNK) => match chunk {
                Ok(Some(chunk)) => out
                    .send(Frame::data_s2c(id, chunk))
                    .await
                    .map_err(|_| StreamError::LinkGone)?,
                Ok(None) => break,
                Err(err) => return Err(StreamError::Origin(format!("origin body read failed: {err}"))),
            },
        }
    }
    out.send(Frame::eof_s2c(id))
        .await
        .map_err(|_| StreamError::LinkGone)?;
    stream.advance(StreamEvent::Eof)?;
    stream.advance(StreamEvent::Retired)?;
    Ok(())
}

/// Dials the tunnel origin and relays bytes verbatim in both directions.
async fn tunnel_stream(
    stream: &mut Stream,
    target: &str,
    rx: &mut mpsc::Receiver<Frame>,
    out: &mpsc::Sender<Frame>,
    opts: &OffshoreOpts,
) -> Result<(), StreamError> {
    stream.advance(StreamEvent::Opened)?;
    stream.advance(StreamEvent::RequestForwarded)?;
    let id = stream.id;

    let authority = Authority::from_connect_target(target, 443)?;
    debug!(%authority, "dialing tunnel origin");
    let origin = dial_origin(&authority, opts).await?;

    // zero-length DATA_S2C is the tunnel-ready signal
    out.send(Frame::data_s2c(id, Bytes::new()))
        .await
        .map_err(|_| StreamError::LinkGone)?;
    stream.advance(StreamEvent::TunnelEstablished)?;

    let (mut origin_read, mut origin_write) = origin.into_split();
    let stop = CancellationToken::new();

    let (c2s, s2c) = tokio::join!(
        // ship to origin
        async {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = stop.cancelled() => return PumpEnd::Stopped,
                    frame = rx.recv() => frame,
                };
                let Some(frame) = frame else {
                    stop.cancel();
                    return PumpEnd::LinkDown;
                };
                match frame.kind {
                    FrameKind::DataC2s => {
                        if !frame.payload.is_empty()
                            && let Err(err) = origin_write.write_all(&frame.payload).await
                        {
                            out.send(Frame::error(id, 502, &format!("origin write failed: {err}")))
                                .await
                                .ok();
                            stop.cancel();
                            return PumpEnd::Terminated;
                        }
                    }
                    FrameKind::EofC2s => {
                        origin_write.shutdown().await.ok();
                        return PumpEnd::Eof;
                    }
                    FrameKind::Close | FrameKind::Error => {
                        stop.cancel();
                        return PumpEnd::Terminated;
                    }
                    _ => {
                        stop.cancel();
                        return PumpEnd::Terminated;
                    }
                }
            }
        },
        // origin to ship
        async {
            let mut buf = vec![0u8; DATA_CHUNK];
            loop {
                let read = tokio::select! {
                    biased;
                    _ = stop.cancelled() => return PumpEnd::Stopped,
                    read = origin_read.read(&mut buf) => read,
                };
                match read {
                    Ok(0) => {
                        out.send(Frame::eof_s2c(id)).await.ok();
                        return PumpEnd::Eof;
                    }
                    Ok(n) => {
                        if out
                            .send(Frame::data_s2c(id, Bytes::copy_from_slice(&buf[..n])))
                            .await
                            .is_err()
                        {
                            stop.cancel();
                            return PumpEnd::LinkDown;
                        }
                    }
                    Err(err) => {
                        out.send(Frame::error(id, 502, &format!("origin read failed: {err}")))
                            .await
                            .ok();
                        stop.cancel();
                        return PumpEnd::Terminated;
                    }
                }
            }
        },
    );
    debug!(?c2s, ?s2c, "tunnel pumps finished");

    if c2s == PumpEnd::Eof && s2c == PumpEnd::Eof {
        stream.advance(StreamEvent::Eof)?;
        stream.advance(StreamEvent::Eof)?;
    } else {
        stream.advance(StreamEvent::Terminated)?;
    }
    Ok(())
}

async fn dial_origin(authority: &Authority, opts: &OffshoreOpts) -> Result<TcpStream, StreamError> {
    let origin = timeout(
        opts.origin_connect_timeout,
        TcpStream::connect(authority.to_string()),
    )
    .await
    .map_err(|_| StreamError::Origin(format!("connect to {authority} timed out")))?
    .map_err(|err| StreamError::Origin(format!("connect to {authority} failed: {err}")))?;
    origin.set_nodelay(true).ok();
    Ok(origin)
}
