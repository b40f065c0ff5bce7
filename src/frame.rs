//! Frame codec for the ship-to-shore link.
//!
//! Every frame carries the id of the stream it belongs to, a kind tag, and a
//! length-prefixed opaque payload:
//!
//! ```text
//! +----------------+-----------+--------------------+-------------------+
//! |  StreamId(u32) |  Kind(u8) |  PayloadLen(u32)   |  Payload(bytes)   |
//! +----------------+-----------+--------------------+-------------------+
//! ```
//!
//! All integers are big-endian. Only one stream is active on the link at a
//! time, but the id still appears on every frame so a late frame from a
//! retired stream can be identified and dropped by the receiver.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single frame payload. Larger logical payloads are split
/// across successive `DATA_*` frames of the same stream.
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Chunk size used when slicing request/response/tunnel bytes into frames.
pub const DATA_CHUNK: usize = 32 * 1024;

const HEADER_LEN: usize = 4 + 1 + 4;

/// Errors raised by the codec. All of them are fatal to the link session.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error on link")]
    Io(#[from] io::Error),

    #[error("unknown frame kind tag {0:#04x}")]
    UnknownKind(u8),

    #[error("frame payload of {len} bytes exceeds cap of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),
}

/// The closed set of frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Opens a new stream. Payload: stream kind tag plus tunnel target.
    Open,
    /// Ship-to-offshore payload bytes.
    DataC2s,
    /// Offshore-to-ship payload bytes. A zero-length `DataS2c` is the
    /// tunnel-ready signal for TUNNEL streams.
    DataS2c,
    /// Ship has no more bytes to send on this stream.
    EofC2s,
    /// Offshore has no more bytes to send on this stream.
    EofS2c,
    /// Forces the stream to its terminal state immediately.
    Close,
    /// `Close` with a diagnostic payload: status code plus reason.
    Error,
}

impl FrameKind {
    fn tag(self) -> u8 {
        match self {
            FrameKind::Open => 1,
            FrameKind::DataC2s => 2,
            FrameKind::DataS2c => 3,
            FrameKind::EofC2s => 4,
            FrameKind::EofS2c => 5,
            FrameKind::Close => 6,
            FrameKind::Error => 7,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, FrameError> {
        Ok(match tag {
            1 => FrameKind::Open,
            2 => FrameKind::DataC2s,
            3 => FrameKind::DataS2c,
            4 => FrameKind::EofC2s,
            5 => FrameKind::EofS2c,
            6 => FrameKind::Close,
            7 => FrameKind::Error,
            other => return Err(FrameError::UnknownKind(other)),
        })
    }
}

/// What a stream carries: a marshalled HTTP exchange or an opaque tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// A plain HTTP request/response exchange.
    Request,
    /// A CONNECT tunnel relaying bytes verbatim in both directions.
    Tunnel,
}

impl StreamKind {
    fn tag(self) -> u8 {
        match self {
            StreamKind::Request => 0,
            StreamKind::Tunnel => 1,
        }
    }
}

/// The atomic wire unit of the link protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Id of the stream this frame belongs to. Monotonically assigned by
    /// the ship, reset on reconnection.
    pub stream: u32,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    /// Builds an `OPEN` frame. `target` is the `host:port` for TUNNEL
    /// streams and empty for REQUEST streams.
    pub fn open(stream: u32, kind: StreamKind, target: &str) -> Self {
        let mut payload = BytesMut::with_capacity(1 + target.len());
        payload.put_u8(kind.tag());
        payload.put_slice(target.as_bytes());
        Self {
            stream,
            kind: FrameKind::Open,
            payload: payload.freeze(),
        }
    }

    pub fn data_c2s(stream: u32, payload: Bytes) -> Self {
        Self {
            stream,
            kind: FrameKind::DataC2s,
            payload,
        }
    }

    pub fn data_s2c(stream: u32, payload: Bytes) -> Self {
        Self {
            stream,
            kind: FrameKind::DataS2c,
            payload,
        }
    }

    pub fn eof_c2s(stream: u32) -> Self {
        Self {
            stream,
            kind: FrameKind::EofC2s,
            payload: Bytes::new(),
        }
    }

    pub fn eof_s2c(stream: u32) -> Self {
        Self {
            stream,
            kind: FrameKind::EofS2c,
            payload: Bytes::new(),
        }
    }

    pub fn close(stream: u32) -> Self {
        Self {
            stream,
            kind: FrameKind::Close,
            payload: Bytes::new(),
        }
    }

    /// Builds an `ERROR` frame carrying an HTTP status code and a reason.
    pub fn error(stream: u32, status: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(status);
        payload.put_slice(reason.as_bytes());
        Self {
            stream,
            kind: FrameKind::Error,
            payload: payload.freeze(),
        }
    }

    /// Decodes the stream kind and tunnel target out of an `OPEN` payload.
    pub fn decode_open(&self) -> Result<(StreamKind, String), FrameError> {
        let malformed = || FrameError::MalformedPayload("OPEN");
        let (&tag, target) = self.payload.split_first().ok_or_else(malformed)?;
        let kind = match tag {
            0 => StreamKind::Request,
            1 => StreamKind::Tunnel,
            _ => return Err(malformed()),
        };
        let target = std::str::from_utf8(target).map_err(|_| malformed())?;
        Ok((kind, target.to_string()))
    }

    /// Decodes the status code and reason out of an `ERROR` payload.
    pub fn decode_error(&self) -> Result<(u16, String), FrameError> {
        let malformed = || FrameError::MalformedPayload("ERROR");
        if self.payload.len() < 2 {
            return Err(malformed());
        }
        let status = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let reason = std::str::from_utf8(&self.payload[2..]).map_err(|_| malformed())?;
        Ok((status, reason.to_string()))
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN + self.payload.len());
        buf.put_u32(self.stream);
        buf.put_u8(self.kind.tag());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Reads one frame off the link.
    ///
    /// A short read, an unknown kind tag, or a declared payload length above
    /// `max_payload` is a protocol error; no partial frame is ever returned.
    pub async fn read_from<R>(reader: &mut R, max_payload: usize) -> Result<Self, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let stream = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let kind = FrameKind::from_tag(header[4])?;
        let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
        if len > max_payload {
            return Err(FrameError::PayloadTooLarge {
                len,
                max: max_payload,
            });
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Self {
            stream,
            kind,
            payload: payload.into(),
        })
    }
}

/// Writes one frame as a single contiguous byte sequence.
///
/// The caller serialises concurrent writers (send mutex on the ship, writer
/// task on the offshore side) so frames never interleave on the wire.
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.payload.len());
    frame.encode(&mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await
}
