use std::str::FromStr;

use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    header,
    uri::{Scheme, Uri},
};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{HEADER_SECTION_MAX_LENGTH, util::BufferedReader};

/// Errors raised while parsing or framing HTTP/1.x messages.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("i/o error while reading message head")]
    Io(#[from] io::Error),

    #[error("invalid HTTP {0}")]
    Invalid(&'static str),

    #[error("header section exceeds the buffer limit")]
    HeadTooLarge,

    #[error("connection closed before end of message")]
    UnexpectedEof,

    #[error("invalid Content-Length value")]
    BadContentLength,

    #[error("invalid chunked transfer encoding")]
    BadChunk,

    #[error("request target is not proxyable")]
    BadTarget,
}

/// Host and port parsed from HTTP request targets.
#[derive(Debug, Clone, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal without scheme. IPv6 literals keep their
    /// brackets so [`Display`](std::fmt::Display) yields a dialable address.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl Authority {
    /// Parses an authority-form request target (`host:port`), as used by
    /// CONNECT. A missing port falls back to `default_port`.
    pub(crate) fn from_connect_target(s: &str, default_port: u16) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Err(ParseError::BadTarget);
        }
        if let Some(rest) = s.strip_prefix('[') {
            let (host, suffix) = rest.split_once(']').ok_or(ParseError::BadTarget)?;
            let port = match suffix.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| ParseError::BadTarget)?,
                None if suffix.is_empty() => default_port,
                None => return Err(ParseError::BadTarget),
            };
            return Ok(Self {
                host: format!("[{host}]"),
                port,
            });
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => Ok(Self {
                host: host.to_string(),
                port: port.parse().map_err(|_| ParseError::BadTarget)?,
            }),
            Some(_) => Err(ParseError::BadTarget),
            None => Ok(Self {
                host: s.to_string(),
                port: default_port,
            }),
        }
    }

    /// Parses an absolute-form URI and infers the port from the scheme.
    pub(crate) fn from_absolute_uri(uri: &Uri) -> Result<Self, ParseError> {
        let authority = uri.authority().ok_or(ParseError::BadTarget)?;
        let host = authority.host();
        let port = match authority.port_u16() {
            Some(port) => port,
            None => match uri.scheme() {
                Some(scheme) if *scheme == Scheme::HTTP => 80,
                Some(scheme) if *scheme == Scheme::HTTPS => 443,
                _ => return Err(ParseError::BadTarget),
            },
        };
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        Ok(Self { host, port })
    }
}

/// Splits an absolute-form request target into the origin authority and the
/// origin-form path to send on the origin connection.
pub(crate) fn split_absolute_target(target: &str) -> Result<(Authority, String), ParseError> {
    let uri = Uri::from_str(target).map_err(|_| ParseError::Invalid("request target"))?;
    let authority = Authority::from_absolute_uri(&uri)?;
    let path = match uri.path_and_query() {
        Some(pq) if !pq.as_str().is_empty() => pq.as_str().to_string(),
        _ => "/".to_string(),
    };
    Ok((authority, path))
}

/// How a work item must be run on the link.
#[derive(Debug)]
pub(crate) enum ProxyTarget {
    /// CONNECT authority-form target; relayed as an opaque tunnel.
    Tunnel(Authority),
    /// Absolute-form request target; marshalled as a framed HTTP exchange.
    Absolute(String),
}

/// Parsed request line and header section.
#[derive(Debug)]
pub struct RequestHead {
    /// HTTP method from the request line.
    pub method: Method,
    /// Raw request target as received.
    pub target: String,
    /// Header map as received, duplicates preserved.
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Parses a request head from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the head.
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>, ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req
            .parse(buf)
            .map_err(|_| ParseError::Invalid("request head"))?
        {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let method = req
                    .method
                    .ok_or(ParseError::Invalid("request method"))?
                    .parse()
                    .map_err(|_| ParseError::Invalid("request method"))?;
                let target = req
                    .path
                    .ok_or(ParseError::Invalid("request target"))?
                    .to_string();
                let headers = header_map(req.headers);
                Ok(Some((
                    header_len,
                    Self {
                        method,
                        target,
                        headers,
                    },
                )))
            }
        }
    }

    /// Reads and parses the request line and header section, removing it
    /// from `reader`. Bounded by [`HEADER_SECTION_MAX_LENGTH`].
    pub(crate) async fn read<R>(reader: &mut BufferedReader<R>) -> Result<Self, ParseError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some((len, head)) = Self::parse(reader.buffer())? {
                reader.consume(len);
                return Ok(head);
            }
            if reader.buffer().len() >= HEADER_SECTION_MAX_LENGTH {
                return Err(ParseError::HeadTooLarge);
            }
            if reader.fill().await? == 0 {
                return Err(ParseError::UnexpectedEof);
            }
        }
    }

    /// Classifies the request target per RFC 9110 proxy semantics.
    ///
    /// Origin-form targets are promoted to absolute `http://` targets using
    /// the `Host` header, matching what user agents that skip absolute-form
    /// expect from an explicit proxy.
    pub(crate) fn proxy_target(&self) -> Result<ProxyTarget, ParseError> {
        if self.method == Method::CONNECT {
            return Ok(ProxyTarget::Tunnel(Authority::from_connect_target(
                &self.target,
                443,
            )?));
        }
        let uri = Uri::from_str(&self.target).map_err(|_| ParseError::Invalid("request target"))?;
        if uri.scheme().is_some() {
            return Ok(ProxyTarget::Absolute(self.target.clone()));
        }
        let host = self
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .ok_or(ParseError::BadTarget)?;
        Ok(ProxyTarget::Absolute(format!("http://{host}{}", self.target)))
    }

    /// Determines how the request body is framed.
    ///
    /// `Transfer-Encoding: chunked` wins over `Content-Length`; without
    /// either the request has no body. Must be consulted before hop-by-hop
    /// headers are stripped.
    pub(crate) fn body_mode(&self) -> Result<BodyMode, ParseError> {
        if has_header_token(&self.headers, header::TRANSFER_ENCODING, "chunked") {
            return Ok(BodyMode::Chunked);
        }
        match parse_content_length(&self.headers)? {
            Some(0) | None => Ok(BodyMode::Empty),
            Some(len) => Ok(BodyMode::Length(len)),
        }
    }

    /// Serialises the start line (with the given target) and header section,
    /// including the terminating blank line.
    pub(crate) fn encode(&self, target: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(target.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");
        encode_headers(&self.headers, &mut out);
        out
    }
}

/// Parsed response status line and header section.
#[derive(Debug)]
pub struct ResponseHead {
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Header map as received, duplicates preserved.
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Parses a response head from a buffer and returns `None` when incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>, ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res
            .parse(buf)
            .map_err(|_| ParseError::Invalid("response head"))?
        {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.ok_or(ParseError::Invalid("response status"))?;
                let status = StatusCode::from_u16(code)
                    .map_err(|_| ParseError::Invalid("response status"))?;
                let reason = res.reason.map(ToOwned::to_owned);
                let headers = header_map(res.headers);
                Ok(Some((
                    header_len,
                    Self {
                        status,
                        reason,
                        headers,
                    },
                )))
            }
        }
    }

    /// Reads and parses the status line and header section, removing it
    /// from `reader`. Bounded by [`HEADER_SECTION_MAX_LENGTH`].
    pub(crate) async fn read<R>(reader: &mut BufferedReader<R>) -> Result<Self, ParseError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some((len, head)) = Self::parse(reader.buffer())? {
                reader.consume(len);
                return Ok(head);
            }
            if reader.buffer().len() >= HEADER_SECTION_MAX_LENGTH {
                return Err(ParseError::HeadTooLarge);
            }
            if reader.fill().await? == 0 {
                return Err(ParseError::UnexpectedEof);
            }
        }
    }

    /// Determines how the response body is framed, per the request method
    /// and the status code. Must be consulted before hop-by-hop headers are
    /// stripped.
    pub(crate) fn body_mode(&self, request_method: &Method) -> Result<BodyMode, ParseError> {
        let code = self.status.as_u16();
        if *request_method == Method::HEAD
            || (100..200).contains(&code)
            || code == 204
            || code == 304
        {
            return Ok(BodyMode::Empty);
        }
        if has_header_token(&self.headers, header::TRANSFER_ENCODING, "chunked") {
            return Ok(BodyMode::Chunked);
        }
        match parse_content_length(&self.headers)? {
            Some(0) => Ok(BodyMode::Empty),
            Some(len) => Ok(BodyMode::Length(len)),
            None => Ok(BodyMode::UntilClose),
        }
    }

    /// Returns the reason phrase or a canonical reason if available.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Formats a status line suitable for an HTTP/1.x response.
    pub fn status_line(&self) -> String {
        format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), self.reason())
    }

    /// Serialises the status line and header section, including the
    /// terminating blank line.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.status_line().as_bytes());
        encode_headers(&self.headers, &mut out);
        out
    }
}

fn header_map(headers: &mut [httparse::Header<'_>]) -> HeaderMap {
    HeaderMap::from_iter(headers.iter_mut().flat_map(|h| {
        let value = HeaderValue::from_bytes(h.value).ok()?;
        let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
        Some((name, value))
    }))
}

fn encode_headers(headers: &HeaderMap, out: &mut Vec<u8>) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

/// Hop-by-hop headers per RFC 7230 section 6.1, plus proxy credentials.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any header named in `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let mut listed = Vec::new();
    for value in headers.get_all(header::CONNECTION) {
        let Ok(value) = value.to_str() else { continue };
        for token in value.split(',') {
            if let Ok(name) = HeaderName::from_str(token.trim()) {
                listed.push(name);
            }
        }
    }
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Inserts a `Host` header derived from the target authority if absent.
pub(crate) fn ensure_host(headers: &mut HeaderMap, authority: &Authority) {
    if headers.contains_key(header::HOST) {
        return;
    }
    let host = if authority.port == 80 {
        authority.host.clone()
    } else {
        authority.to_string()
    };
    if let Ok(value) = HeaderValue::from_str(&host) {
        headers.insert(header::HOST, value);
    }
}

/// Case-insensitive comma-separated token match on all values of a header.
pub(crate) fn has_header_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|value| value.trim().eq_ignore_ascii_case(token))
}

fn parse_content_length(headers: &HeaderMap) -> Result<Option<u64>, ParseError> {
    let mut length = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(ParseError::BadContentLength)?;
        length = Some(parsed);
    }
    Ok(length)
}

/// Message-body framing per the reduced RFC 7230 rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    /// No body follows the head.
    Empty,
    /// Exactly this many bytes follow the head.
    Length(u64),
    /// Chunked transfer coding; decoded at the proxy boundary.
    Chunked,
    /// Body runs until the peer closes the connection.
    UntilClose,
}

impl BodyMode {
    pub(crate) fn reader_state(self) -> BodyState {
        match self {
            BodyMode::Empty => BodyState::Done,
            BodyMode::Length(0) => BodyState::Done,
            BodyMode::Length(n) => BodyState::Remaining(n),
            BodyMode::Chunked => BodyState::ChunkSize,
            BodyMode::UntilClose => BodyState::UntilClose,
        }
    }
}

/// Progress of an incremental body read. State is updated as soon as bytes
/// are consumed, so a cancelled [`next_body_chunk`] call can be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyState {
    Done,
    Remaining(u64),
    UntilClose,
    ChunkSize,
    ChunkData(u64),
    ChunkDataEnd,
    Trailers,
}

/// Returns the next decoded chunk of the message body, or `None` once the
/// body is complete. Chunked transfer coding is removed; at most `max`
/// bytes are returned per call.
pub(crate) async fn next_body_chunk<R>(
    reader: &mut BufferedReader<R>,
    state: &mut BodyState,
    max: usize,
) -> Result<Option<Bytes>, ParseError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match *state {
            BodyState::Done => return Ok(None),
            BodyState::Remaining(n) => {
                let take = max.min(usize::try_from(n).unwrap_or(usize::MAX));
                let chunk = reader.read_chunk(take).await?;
                if chunk.is_empty() {
                    return Err(ParseError::UnexpectedEof);
                }
                let left = n - chunk.len() as u64;
                *state = if left == 0 {
                    BodyState::Done
                } else {
                    BodyState::Remaining(left)
                };
                return Ok(Some(chunk));
            }
            BodyState::UntilClose => {
                let chunk = reader.read_chunk(max).await?;
                if chunk.is_empty() {
                    *state = BodyState::Done;
                    return Ok(None);
                }
                return Ok(Some(chunk));
            }
            BodyState::ChunkSize => {
                let line = read_crlf_line(reader).await?;
                let size = parse_chunk_size(&line)?;
                *state = if size == 0 {
                    BodyState::Trailers
                } else {
                    BodyState::ChunkData(size)
                };
            }
            BodyState::ChunkData(n) => {
                let take = max.min(usize::try_from(n).unwrap_or(usize::MAX));
                let chunk = reader.read_chunk(take).await?;
                if chunk.is_empty() {
                    return Err(ParseError::UnexpectedEof);
                }
                let left = n - chunk.len() as u64;
                *state = if left == 0 {
                    BodyState::ChunkDataEnd
                } else {
                    BodyState::ChunkData(left)
                };
                return Ok(Some(chunk));
            }
            BodyState::ChunkDataEnd => {
                let line = read_crlf_line(reader).await?;
                if !line.is_empty() {
                    return Err(ParseError::BadChunk);
                }
                *state = BodyState::ChunkSize;
            }
            BodyState::Trailers => {
                let line = read_crlf_line(reader).await?;
                if line.is_empty() {
                    *state = BodyState::Done;
                    return Ok(None);
                }
            }
        }
    }
}

async fn read_crlf_line<R>(reader: &mut BufferedReader<R>) -> Result<Vec<u8>, ParseError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = reader.buffer().iter().position(|&b| b == b'\n') {
            let mut line = reader.buffer()[..pos].to_vec();
            reader.consume(pos + 1);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(line);
        }
        if reader.buffer().len() > HEADER_SECTION_MAX_LENGTH {
            return Err(ParseError::BadChunk);
        }
        if reader.fill().await? == 0 {
            return Err(ParseError::UnexpectedEof);
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::BadChunk)?;
    let size = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16).map_err(|_| ParseError::BadChunk)
}

/// Writes a minimal `text/plain` error response and flushes it.
pub(crate) async fn write_error_response<W>(
    writer: &mut W,
    status: StatusCode,
    reason: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let phrase = if reason.is_empty() {
        status.canonical_reason().unwrap_or("")
    } else {
        reason
    };
    let body = format!("{} {}\n", status.as_u16(), phrase);
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await
}
