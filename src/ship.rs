//! Ship-side proxy: the local listener, the FIFO scheduler, and the
//! handlers that translate one user-agent request into link frames.
//!
//! Producers (one lightweight task per accepted socket) parse the request
//! head and enqueue a work item; a single worker runs one stream end-to-end
//! before taking the next. Only the worker touches the link, so work items
//! hit the wire strictly in arrival order with no frame interleaving.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{StatusCode, header};
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    frame::{DATA_CHUNK, Frame, FrameKind, StreamKind},
    link::{
        InvalidTransition, LinkError, LinkOpts, LinkSession, PumpEnd, Stream, StreamEvent,
        StreamHandle, StreamReceiver, StreamSender,
    },
    parse::{
        Authority, BodyMode, ParseError, ProxyTarget, RequestHead, ensure_host, has_header_token,
        next_body_chunk, split_absolute_target, strip_hop_by_hop, write_error_response,
    },
    util::BufferedReader,
};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for the ship proxy.
#[derive(Debug, Clone)]
pub struct ShipOpts {
    /// Depth of the pending-work FIFO; producers block when it is full.
    pub queue_depth: usize,
    /// Optional cap on how long the active stream may go without an inbound
    /// frame before it is torn down with an `ERROR`.
    pub stream_idle_timeout: Option<Duration>,
    /// Link maintenance tunables.
    pub link: LinkOpts,
}

impl Default for ShipOpts {
    fn default() -> Self {
        Self {
            queue_depth: 128,
            stream_idle_timeout: None,
            link: LinkOpts::default(),
        }
    }
}

/// A parsed local request waiting for its turn on the link.
struct WorkItem {
    head: RequestHead,
    target: ProxyTarget,
    body_mode: BodyMode,
    ua_reader: BufferedReader<OwnedReadHalf>,
    ua_writer: OwnedWriteHalf,
    peer: SocketAddr,
}

#[derive(Debug, thiserror::Error)]
enum ShipError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    State(#[from] InvalidTransition),

    #[error("user agent i/o error")]
    UserAgent(#[source] std::io::Error),
}

/// The ship-side proxy: accepts local user-agent connections and serialises
/// them onto the single offshore link.
pub struct ShipProxy {
    link: Arc<LinkSession>,
    opts: ShipOpts,
}

impl ShipProxy {
    pub fn new(server_addr: impl Into<String>, opts: ShipOpts) -> Self {
        let link = Arc::new(LinkSession::new(server_addr, opts.link.clone()));
        Self { link, opts }
    }

    /// Serves proxy connections from `listener` until `shutdown` fires,
    /// then stops accepting and drains what is already queued.
    pub async fn run(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let (queue_tx, queue_rx) = mpsc::channel(self.opts.queue_depth);
        let mut worker = tokio::spawn(
            worker_loop(self.link.clone(), queue_rx, self.opts.clone())
                .instrument(error_span!("worker")),
        );

        let tracker = TaskTracker::new();
        let mut id = 0u64;
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (socket, peer) = match accepted {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(%err, "failed to accept proxy connection");
                    continue;
                }
            };
            let queue_tx = queue_tx.clone();
            tracker.spawn(
                async move {
                    debug!("accepted proxy connection");
                    if let Err(err) = intake(socket, peer, queue_tx).await {
                        debug!(%err, "rejected local request");
                    }
                }
                .instrument(error_span!("conn", id, %peer)),
            );
            id += 1;
        }

        debug!("shutting down, draining scheduler queue");
        tracker.close();
        let drain = async {
            tracker.wait().await;
            drop(queue_tx);
            let _ = (&mut worker).await;
        };
        match timeout(GRACEFUL_SHUTDOWN_TIMEOUT, drain).await {
            Ok(()) => debug!("scheduler drained cleanly"),
            Err(_) => {
                warn!("pending work did not finish in time at shutdown");
                worker.abort();
            }
        }
        Ok(())
    }
}

/// Parses the head of one local request and enqueues it.
///
/// Malformed requests are answered with `400 Bad Request` and never reach
/// the queue. `Expect: 100-continue` is answered eagerly and stripped;
/// pipelining is not supported (one request per user-agent connection).
async fn intake(
    socket: TcpStream,
    peer: SocketAddr,
    queue: mpsc::Sender<WorkItem>,
) -> Result<(), ParseError> {
    socket.set_nodelay(true).ok();
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufferedReader::new(read_half);

    let mut head = match RequestHead::read(&mut reader).await {
        Ok(head) => head,
        // the agent went away before sending a full head; nothing to answer
        Err(ParseError::Io(_) | ParseError::UnexpectedEof) => return Ok(()),
        Err(err) => {
            write_error_response(&mut write_half, StatusCode::BAD_REQUEST, "malformed request")
                .await
                .ok();
            return Err(err);
        }
    };
    let parsed = head.proxy_target().and_then(|target| {
        let body_mode = match target {
            ProxyTarget::Tunnel(_) => BodyMode::Empty,
            ProxyTarget::Absolute(_) => head.body_mode()?,
        };
        Ok((target, body_mode))
    });
    let (target, body_mode) = match parsed {
        Ok(parsed) => parsed,
        Err(err) => {
            write_error_response(
                &mut write_half,
                StatusCode::BAD_REQUEST,
                "unsupported request target",
            )
            .await
            .ok();
            return Err(err);
        }
    };

    if has_header_token(&head.headers, header::EXPECT, "100-continue") {
        write_half.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
    }
    head.headers.remove(header::EXPECT);

    let item = WorkItem {
        head,
        target,
        body_mode,
        ua_reader: reader,
        ua_writer: write_half,
        peer,
    };
    if queue.send(item).await.is_err() {
        debug!("scheduler queue closed, dropping request");
    }
    Ok(())
}

/// The single consumer: one stream runs to a terminal state before the next
/// work item is dequeued.
async fn worker_loop(link: Arc<LinkSession>, mut queue: mpsc::Receiver<WorkItem>, opts: ShipOpts) {
    while let Some(item) = queue.recv().await {
        let peer = item.peer;
        let result = run_item(&link, item, &opts)
            .instrument(error_span!("stream", %peer))
            .await;
        if let Err(err) = result {
            debug!(%peer, %err, "stream finished with error");
        }
    }
    debug!("scheduler queue drained");
}

async fn run_item(link: &LinkSession, item: WorkItem, opts: &ShipOpts) -> Result<(), ShipError> {
    let WorkItem {
        head,
        target,
        body_mode,
        mut ua_reader,
        mut ua_writer,
        peer: _,
    } = item;
    match target {
        ProxyTarget::Absolute(target) => {
            run_request(
                link,
                head,
                target,
                body_mode,
                &mut ua_reader,
                &mut ua_writer,
                opts,
            )
            .await
        }
        ProxyTarget::Tunnel(authority) => {
            run_tunnel(link, authority, &mut ua_reader, &mut ua_writer, opts).await
        }
    }
}

/// Runs one plain HTTP exchange over the link.
async fn run_request(
    link: &LinkSession,
    head: RequestHead,
    target: String,
    body_mode: BodyMode,
    ua_reader: &mut BufferedReader<OwnedReadHalf>,
    ua_writer: &mut OwnedWriteHalf,
    opts: &ShipOpts,
) -> Result<(), ShipError> {
    let mut handle = link.begin_stream(StreamKind::Request, "").await?;
    let mut stream = Stream::new(handle.id(), StreamKind::Request);
    stream.advance(StreamEvent::Opened)?;
    debug!(stream = stream.id, %target, "running request stream");

    let result = request_exchange(
        &mut handle,
        &mut stream,
        head,
        target,
        body_mode,
        ua_reader,
        ua_writer,
        opts,
    )
    .await;
    link.retire(stream.id);
    // no keep-alive across streams: one response per user-agent socket
    ua_writer.shutdown().await.ok();
    result
}

#[allow(clippy::too_many_arguments)]
async fn request_exchange(
    handle: &mut StreamHandle,
    stream: &mut Stream,
    mut head: RequestHead,
    target: String,
    body_mode: BodyMode,
    ua_reader: &mut BufferedReader<OwnedReadHalf>,
    ua_writer: &mut OwnedWriteHalf,
    opts: &ShipOpts,
) -> Result<(), ShipError> {
    let id = stream.id;

    strip_hop_by_hop(&mut head.headers);
    if let Ok((authority, _)) = split_absolute_target(&target) {
        ensure_host(&mut head.headers, &authority);
    }

    // head travels absolute-form; the dispatcher rewrites it to origin-form
    let send_result: Result<(), ShipError> = async {
        for chunk in head.encode(&target).chunks(DATA_CHUNK) {
            handle
                .sender
                .send(Frame::data_c2s(id, Bytes::copy_from_slice(chunk)))
                .await?;
        }
        let mut body = body_mode.reader_state();
        loop {
            match next_body_chunk(ua_reader, &mut body, DATA_CHUNK).await {
                Ok(Some(chunk)) => handle.sender.send(Frame::data_c2s(id, chunk)).await?,
                Ok(None) => break,
                Err(err) => {
                    // user agent failed mid-body; discard the item, never retry
                    handle.sender.send(Frame::close(id)).await.ok();
                    return Err(err.into());
                }
            }
        }
        handle.sender.send(Frame::eof_c2s(id)).await?;
        Ok(())
    }
    .await;
    if let Err(err) = send_result {
        if matches!(err, ShipError::Link(_)) {
            write_error_response(ua_writer, StatusCode::BAD_GATEWAY, "upstream link failed")
                .await
                .ok();
        }
        stream.advance(StreamEvent::Terminated)?;
        return Err(err);
    }
    stream.advance(StreamEvent::RequestForwarded)?;

    let mut responded = false;
    loop {
        match handle.receiver.recv(opts.stream_idle_timeout).await {
            Ok(frame) => match frame.kind {
                FrameKind::DataS2c => {
                    if !responded {
                        responded = true;
                        stream.advance(StreamEvent::ResponseBegan)?;
                    }
                    if !frame.payload.is_empty()
                        && let Err(err) = ua_writer.write_all(&frame.payload).await
                    {
                        handle.sender.send(Frame::close(id)).await.ok();
                        stream.advance(StreamEvent::Terminated)?;
                        return Err(ShipError::UserAgent(err));
                    }
                }
                FrameKind::EofS2c => {
                    if !responded {
                        write_error_response(
                            ua_writer,
                            StatusCode::BAD_GATEWAY,
                            "empty response from offshore",
                        )
                        .await
                        .ok();
                        stream.advance(StreamEvent::Terminated)?;
                        break;
                    }
                    stream.advance(StreamEvent::Eof)?;
                    stream.advance(StreamEvent::Retired)?;
                    break;
                }
                FrameKind::Error => {
                    let (status, reason) = decode_error_frame(&handle.sender, &frame)?;
                    warn!(stream = id, status, %reason, "offshore reported stream failure");
                    if !responded {
                        let status =
                            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                        write_error_response(ua_writer, status, &reason).await.ok();
                    }
                    stream.advance(StreamEvent::Terminated)?;
                    break;
                }
                FrameKind::Close => {
                    stream.advance(StreamEvent::Terminated)?;
                    break;
                }
                FrameKind::Open | FrameKind::DataC2s | FrameKind::EofC2s => {
                    handle.sender.poison();
                    stream.advance(StreamEvent::Terminated)?;
                    return Err(LinkError::UnexpectedFrame(frame.kind).into());
                }
            },
            Err(LinkError::IdleTimeout) => {
                handle
                    .sender
                    .send(Frame::error(id, 504, "stream idle timeout"))
                    .await
                    .ok();
                if !responded {
                    write_error_response(
                        ua_writer,
                        StatusCode::GATEWAY_TIMEOUT,
                        "stream idle timeout",
                    )
                    .await
                    .ok();
                }
                stream.advance(StreamEvent::Terminated)?;
                return Err(LinkError::IdleTimeout.into());
            }
            Err(err) => {
                // the link died mid-stream: 502 if the response never
                // started, otherwise a truncating close
                if !responded {
                    write_error_response(ua_writer, StatusCode::BAD_GATEWAY, "upstream link failed")
                        .await
                        .ok();
                }
                stream.advance(StreamEvent::Terminated)?;
                return Err(err.into());
            }
        }
    }
    Ok(())
}

/// Runs one CONNECT tunnel over the link.
async fn run_tunnel(
    link: &LinkSession,
    authority: Authority,
    ua_reader: &mut BufferedReader<OwnedReadHalf>,
    ua_writer: &mut OwnedWriteHalf,
    opts: &ShipOpts,
) -> Result<(), ShipError> {
    let mut handle = link
        .begin_stream(StreamKind::Tunnel, &authority.to_string())
        .await?;
    let mut stream = Stream::new(handle.id(), StreamKind::Tunnel);
    stream.advance(StreamEvent::Opened)?;
    stream.advance(StreamEvent::RequestForwarded)?;
    debug!(stream = stream.id, target = %authority, "running tunnel stream");

    let result = tunnel_exchange(&mut handle, &mut stream, ua_reader, ua_writer, opts).await;
    link.retire(stream.id);
    ua_writer.shutdown().await.ok();
    result
}

/// Decodes an `ERROR` payload; a malformed one is a link protocol error.
fn decode_error_frame(sender: &StreamSender, frame: &Frame) -> Result<(u16, String), LinkError> {
    frame.decode_error().map_err(|err| {
        sender.poison();
        LinkError::Protocol(err)
    })
}

async fn tunnel_exchange(
    handle: &mut StreamHandle,
    stream: &mut Stream,
    ua_reader: &mut BufferedReader<OwnedReadHalf>,
    ua_writer: &mut OwnedWriteHalf,
    opts: &ShipOpts,
) -> Result<(), ShipError> {
    let id = stream.id;

    // wait for the tunnel-ready signal: a zero-length DATA_S2C
    match handle.receiver.recv(opts.stream_idle_timeout).await {
        Ok(frame) => match frame.kind {
            FrameKind::DataS2c => {}
            FrameKind::Error => {
                let (status, reason) = decode_error_frame(&handle.sender, &frame)?;
                warn!(stream = id, status, %reason, "tunnel open refused");
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                write_error_response(ua_writer, status, &reason).await.ok();
                stream.advance(StreamEvent::Terminated)?;
                return Ok(());
            }
            FrameKind::Close => {
                write_error_response(ua_writer, StatusCode::BAD_GATEWAY, "tunnel open refused")
                    .await
                    .ok();
                stream.advance(StreamEvent::Terminated)?;
                return Ok(());
            }
            other => {
                handle.sender.poison();
                stream.advance(StreamEvent::Terminated)?;
                return Err(LinkError::UnexpectedFrame(other).into());
            }
        },
        Err(LinkError::IdleTimeout) => {
            handle
                .sender
                .send(Frame::error(id, 504, "tunnel open timed out"))
                .await
                .ok();
            write_error_response(ua_writer, StatusCode::GATEWAY_TIMEOUT, "tunnel open timed out")
                .await
                .ok();
            stream.advance(StreamEvent::Terminated)?;
            return Err(LinkError::IdleTimeout.into());
        }
        Err(err) => {
            write_error_response(ua_writer, StatusCode::BAD_GATEWAY, "upstream link failed")
                .await
                .ok();
            stream.advance(StreamEvent::Terminated)?;
            return Err(err.into());
        }
    }
    stream.advance(StreamEvent::TunnelEstablished)?;

    ua_writer
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .map_err(ShipError::UserAgent)?;

    // full duplex within the one active stream: two pumps, one shared
    // frame writer underneath
    let stop = CancellationToken::new();
    let sender = handle.sender.clone();
    let (up, down) = tokio::join!(
        uplink_pump(&sender, id, ua_reader, &stop),
        downlink_pump(
            &mut handle.receiver,
            &sender,
            id,
            ua_writer,
            &stop,
            opts.stream_idle_timeout,
        ),
    );
    debug!(stream = id, ?up, ?down, "tunnel pumps finished");

    if up == PumpEnd::Eof && down == PumpEnd::Eof {
        stream.advance(StreamEvent::Eof)?;
        stream.advance(StreamEvent::Eof)?;
        Ok(())
    } else {
        stream.advance(StreamEvent::Terminated)?;
        if up == PumpEnd::LinkDown || down == PumpEnd::LinkDown {
            Err(LinkError::Down.into())
        } else {
            Ok(())
        }
    }
}

/// Relays user-agent bytes into `DATA_C2S` frames. A clean EOF half-closes
/// the tunnel; a read error forces `CLOSE`.
async fn uplink_pump(
    sender: &StreamSender,
    id: u32,
    ua_reader: &mut BufferedReader<OwnedReadHalf>,
    stop: &CancellationToken,
) -> PumpEnd {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = stop.cancelled() => return PumpEnd::Stopped,
            chunk = ua_reader.read_chunk(DATA_CHUNK) => chunk,
        };
        match chunk {
            Ok(chunk) if chunk.is_empty() => {
                sender.send(Frame::eof_c2s(id)).await.ok();
                return PumpEnd::Eof;
            }
            Ok(chunk) => {
                if sender.send(Frame::data_c2s(id, chunk)).await.is_err() {
                    stop.cancel();
                    return PumpEnd::LinkDown;
                }
            }
            Err(err) => {
                debug!(stream = id, %err, "user agent read failed, closing tunnel");
                sender.send(Frame::close(id)).await.ok();
                stop.cancel();
                return PumpEnd::Terminated;
            }
        }
    }
}

/// Relays `DATA_S2C` frames to the user agent until `EOF_S2C`, `CLOSE`, or
/// `ERROR`.
async fn downlink_pump(
    receiver: &mut StreamReceiver,
    sender: &StreamSender,
    id: u32,
    ua_writer: &mut OwnedWriteHalf,
    stop: &CancellationToken,
    idle_timeout: Option<Duration>,
) -> PumpEnd {
    loop {
        let frame = tokio::select! {
            biased;
            _ = stop.cancelled() => return PumpEnd::Stopped,
            frame = receiver.recv(idle_timeout) => frame,
        };
        match frame {
            Ok(frame) => match frame.kind {
                FrameKind::DataS2c => {
                    if !frame.payload.is_empty()
                        && let Err(err) = ua_writer.write_all(&frame.payload).await
                    {
                        debug!(stream = id, %err, "user agent write failed, closing tunnel");
                        sender.send(Frame::close(id)).await.ok();
                        stop.cancel();
                        return PumpEnd::Terminated;
                    }
                }
                FrameKind::EofS2c => {
                    ua_writer.shutdown().await.ok();
                    return PumpEnd::Eof;
                }
                FrameKind::Close => {
                    stop.cancel();
                    return PumpEnd::Terminated;
                }
                FrameKind::Error => {
                    if let Ok((status, reason)) = frame.decode_error() {
                        warn!(stream = id, status, %reason, "offshore reported tunnel failure");
                    }
                    stop.cancel();
                    return PumpEnd::Terminated;
                }
                FrameKind::Open | FrameKind::DataC2s | FrameKind::EofC2s => {
                    sender.poison();
                    stop.cancel();
                    return PumpEnd::LinkDown;
                }
            },
            Err(LinkError::IdleTimeout) => {
                sender
                    .send(Frame::error(id, 504, "stream idle timeout"))
                    .await
                    .ok();
                stop.cancel();
                return PumpEnd::Terminated;
            }
            Err(_) => {
                stop.cancel();
                return PumpEnd::LinkDown;
            }
        }
    }
}
