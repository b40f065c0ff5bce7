use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};

use crate::{
    OffshoreOpts, OffshoreProxy, ResponseHead, ShipOpts, ShipProxy, net::bind_listener,
};

// -- Test helpers --

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sealink=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

type OffshoreTask = AbortOnDropHandle<std::io::Result<()>>;
type ShipTask = AbortOnDropHandle<std::io::Result<()>>;

/// Spawns an offshore relay on an ephemeral port.
async fn spawn_offshore() -> (SocketAddr, CancellationToken, OffshoreTask) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    spawn_offshore_on(listener)
}

/// Spawns an offshore relay on an existing listener (used to restart the
/// relay on the same port).
fn spawn_offshore_on(listener: TcpListener) -> (SocketAddr, CancellationToken, OffshoreTask) {
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let proxy = OffshoreProxy::new(OffshoreOpts::default());
            proxy.run(listener, shutdown).await
        }
    });
    (addr, shutdown, AbortOnDropHandle::new(task))
}

/// Spawns a ship proxy pointed at `server`, with fast reconnect backoff so
/// the recovery tests stay snappy.
async fn spawn_ship(server: SocketAddr) -> (SocketAddr, ShipTask) {
    let mut opts = ShipOpts::default();
    opts.link.connect_timeout = Duration::from_secs(2);
    opts.link.initial_backoff = Duration::from_millis(50);
    opts.link.max_backoff = Duration::from_millis(500);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let proxy = ShipProxy::new(server.to_string(), opts);
        proxy.run(listener, CancellationToken::new()).await
    });
    (addr, AbortOnDropHandle::new(task))
}

/// Spawns a simple HTTP origin server that echoes back "{label} {METHOD} {PATH}".
async fn spawn_origin_server(label: &'static str) -> (SocketAddr, AbortOnDropHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(origin_server::run(listener, label));
    (addr, AbortOnDropHandle::new(task))
}

/// Spawns a simple HTTP origin server that echoes back "{label} {METHOD} {PATH}: {BODY}".
async fn spawn_origin_server_echo_body(
    label: &'static str,
) -> (SocketAddr, AbortOnDropHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(origin_server::run_echo_body(listener, label));
    (addr, AbortOnDropHandle::new(task))
}

/// Spawns an origin that reports whether the `x-foo` header reached it.
async fn spawn_header_probe_server() -> (SocketAddr, AbortOnDropHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(origin_server::run_header_probe(listener));
    (addr, AbortOnDropHandle::new(task))
}

/// Spawns a raw TCP origin that answers any request with a chunked body.
async fn spawn_chunked_origin() -> (SocketAddr, AbortOnDropHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                read_head_raw(&mut stream).await;
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                          4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
                    )
                    .await;
            });
        }
    });
    (addr, AbortOnDropHandle::new(task))
}

/// Spawns a simple TCP echo server.
async fn spawn_echo_server() -> (SocketAddr, AbortOnDropHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    (addr, AbortOnDropHandle::new(task))
}

/// A reqwest client routing everything through the ship proxy. The ship
/// closes the socket after every response, so connection pooling is off.
fn proxied_client(proxy_addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy_addr}")).unwrap())
        .pool_max_idle_per_host(0)
        .build()
        .unwrap()
}

/// Reads one header section (through the terminating blank line) off a raw
/// stream and returns it.
async fn read_head_raw(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = Vec::new();
    let mut buf = [0u8; 256];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before end of header section");
        head.extend_from_slice(&buf[..n]);
    }
    head
}

/// Issues a CONNECT request and returns the stream, the proxy's status
/// code, and any bytes that arrived after the response head.
async fn open_connect_tunnel(
    proxy_addr: SocketAddr,
    target: impl std::fmt::Display,
) -> (TcpStream, u16, Vec<u8>) {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let raw = read_head_raw(&mut stream).await;
    let (head_len, response) = ResponseHead::parse(&raw).unwrap().expect("complete head");
    (stream, response.status.as_u16(), raw[head_len..].to_vec())
}

/// Reads a full HTTP response off a raw stream and returns (status, body).
/// Relies on the ship closing the socket after one response.
async fn read_http_response(stream: &mut TcpStream) -> (u16, Vec<u8>) {
    let mut raw = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
        .await
        .expect("response timed out")
        .unwrap();
    let (head_len, response) = ResponseHead::parse(&raw).unwrap().expect("complete response");
    (response.status.as_u16(), raw[head_len..].to_vec())
}

// -- End-to-end scenarios --

/// Plain GET through ship and offshore reaches the origin and back.
#[tokio::test]
async fn forward_get_roundtrip() {
    init_tracing();
    let (origin_addr, _origin) = spawn_origin_server("origin").await;
    let (offshore_addr, _offshore_shutdown, _offshore) = spawn_offshore().await;
    let (proxy_addr, _ship) = spawn_ship(offshore_addr).await;

    let client = proxied_client(proxy_addr);
    let res = client
        .get(format!("http://{origin_addr}/test/path"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(res.text().await.unwrap(), "origin GET /test/path");
}

/// POST bodies cross the link byte-for-byte.
#[tokio::test]
async fn forward_post_with_body() {
    init_tracing();
    let (origin_addr, _origin) = spawn_origin_server_echo_body("origin").await;
    let (offshore_addr, _offshore_shutdown, _offshore) = spawn_offshore().await;
    let (proxy_addr, _ship) = spawn_ship(offshore_addr).await;

    let client = proxied_client(proxy_addr);
    let res = client
        .post(format!("http://{origin_addr}/p"))
        .body("ping")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(res.text().await.unwrap(), "origin POST /p: ping");
}

/// A CONNECT tunnel relays bytes verbatim in both directions and honours
/// half-close.
#[tokio::test]
async fn connect_tunnel_is_transparent() {
    init_tracing();
    let (echo_addr, _echo) = spawn_echo_server().await;
    let (offshore_addr, _offshore_shutdown, _offshore) = spawn_offshore().await;
    let (proxy_addr, _ship) = spawn_ship(offshore_addr).await;

    let (mut stream, status, leftover) = open_connect_tunnel(proxy_addr, echo_addr).await;
    assert_eq!(status, 200);
    assert!(leftover.is_empty());

    let first: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    stream.write_all(&first).await.unwrap();
    let mut echoed = vec![0u8; first.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(echoed, first);

    let second: Vec<u8> = (0..2048u32).map(|i| (i.wrapping_mul(7) % 256) as u8).collect();
    stream.write_all(&second).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("tunnel close timed out")
        .unwrap();
    assert_eq!(rest, second);
}

/// Two concurrent requests are serialised: the second cannot finish before
/// the first stream reaches a terminal state.
#[tokio::test]
async fn requests_are_serialised_on_the_link() {
    init_tracing();
    let (origin_addr, _origin) = spawn_origin_server("origin").await;
    let (offshore_addr, _offshore_shutdown, _offshore) = spawn_offshore().await;
    let (proxy_addr, _ship) = spawn_ship(offshore_addr).await;

    let client = proxied_client(proxy_addr);
    let slow = tokio::spawn({
        let client = client.clone();
        let url = format!("http://{origin_addr}/slow");
        async move {
            let res = client.get(url).send().await.unwrap();
            assert_eq!(res.text().await.unwrap(), "origin GET /slow");
            Instant::now()
        }
    });
    // make sure the slow request is enqueued first
    sleep(Duration::from_millis(100)).await;
    let fast = tokio::spawn({
        let client = client.clone();
        let url = format!("http://{origin_addr}/fast");
        async move {
            let res = client.get(url).send().await.unwrap();
            assert_eq!(res.text().await.unwrap(), "origin GET /fast");
            Instant::now()
        }
    });

    let slow_done = slow.await.unwrap();
    let fast_done = fast.await.unwrap();
    assert!(
        fast_done >= slow_done,
        "second request finished before the first stream closed"
    );
}

/// An unreachable origin yields 502 Bad Gateway and the worker advances to
/// the next request.
#[tokio::test]
async fn unreachable_origin_yields_502_then_recovers() {
    init_tracing();
    let (origin_addr, _origin) = spawn_origin_server("origin").await;
    let (offshore_addr, _offshore_shutdown, _offshore) = spawn_offshore().await;
    let (proxy_addr, _ship) = spawn_ship(offshore_addr).await;

    // grab a port nothing listens on
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!("GET http://{dead_addr}/x HTTP/1.1\r\nHost: {dead_addr}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let (status, _body) = read_http_response(&mut stream).await;
    assert_eq!(status, 502);

    let client = proxied_client(proxy_addr);
    let res = client
        .get(format!("http://{origin_addr}/after"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(res.text().await.unwrap(), "origin GET /after");
}

/// CONNECT to an unreachable origin is refused with 502.
#[tokio::test]
async fn connect_unreachable_origin_yields_502() {
    init_tracing();
    let (offshore_addr, _offshore_shutdown, _offshore) = spawn_offshore().await;
    let (proxy_addr, _ship) = spawn_ship(offshore_addr).await;

    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let (_stream, status, _leftover) = open_connect_tunnel(proxy_addr, dead_addr).await;
    assert_eq!(status, 502);
}

/// Garbage on the proxy port is answered with 400 and never enqueued.
#[tokio::test]
async fn malformed_request_yields_400() {
    init_tracing();
    let (offshore_addr, _offshore_shutdown, _offshore) = spawn_offshore().await;
    let (proxy_addr, _ship) = spawn_ship(offshore_addr).await;

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream.write_all(b"NOT VALID HTTP\r\n\r\n").await.unwrap();
    let (status, _body) = read_http_response(&mut stream).await;
    assert_eq!(status, 400);
}

/// Headers named in `Connection` are stripped alongside the static
/// hop-by-hop set before the request reaches the origin.
#[tokio::test]
async fn hop_by_hop_headers_are_stripped() {
    init_tracing();
    let (probe_addr, _probe) = spawn_header_probe_server().await;
    let (offshore_addr, _offshore_shutdown, _offshore) = spawn_offshore().await;
    let (proxy_addr, _ship) = spawn_ship(offshore_addr).await;

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "GET http://{probe_addr}/h HTTP/1.1\r\n\
         Host: {probe_addr}\r\n\
         Connection: close, x-foo\r\n\
         X-Foo: bar\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let (status, body) = read_http_response(&mut stream).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"x-foo=absent");
}

/// Chunked origin responses are decoded at the offshore boundary; the user
/// agent sees a close-delimited identity body.
#[tokio::test]
async fn chunked_response_is_dechunked() {
    init_tracing();
    let (origin_addr, _origin) = spawn_chunked_origin().await;
    let (offshore_addr, _offshore_shutdown, _offshore) = spawn_offshore().await;
    let (proxy_addr, _ship) = spawn_ship(offshore_addr).await;

    let client = proxied_client(proxy_addr);
    let res = client
        .get(format!("http://{origin_addr}/chunked"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert!(res.headers().get("transfer-encoding").is_none());
    assert_eq!(res.text().await.unwrap(), "Wikipedia");
}

/// `Expect: 100-continue` is answered eagerly by the ship and stripped
/// before forwarding.
#[tokio::test]
async fn expect_100_continue_is_answered_eagerly() {
    init_tracing();
    let (origin_addr, _origin) = spawn_origin_server_echo_body("origin").await;
    let (offshore_addr, _offshore_shutdown, _offshore) = spawn_offshore().await;
    let (proxy_addr, _ship) = spawn_ship(offshore_addr).await;

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let head = format!(
        "POST http://{origin_addr}/p HTTP/1.1\r\n\
         Host: {origin_addr}\r\n\
         Expect: 100-continue\r\n\
         Content-Length: 4\r\n\r\n"
    );
    stream.write_all(head.as_bytes()).await.unwrap();
    let interim = read_head_raw(&mut stream).await;
    assert!(interim.starts_with(b"HTTP/1.1 100"));

    stream.write_all(b"ping").await.unwrap();
    let (status, body) = read_http_response(&mut stream).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"origin POST /p: ping");
}

/// After the link is forcibly reset, the ship reconnects within its backoff
/// bound and the next request is served.
#[tokio::test]
async fn ship_reconnects_after_link_drop() {
    init_tracing();
    let (origin_addr, _origin) = spawn_origin_server("origin").await;
    let (offshore_addr, offshore_shutdown, offshore_task) = spawn_offshore().await;
    let (proxy_addr, _ship) = spawn_ship(offshore_addr).await;

    let client = proxied_client(proxy_addr);
    let res = client
        .get(format!("http://{origin_addr}/before"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.text().await.unwrap(), "origin GET /before");

    // kill the offshore relay and bring it back on the same port
    offshore_shutdown.cancel();
    offshore_task.await.unwrap().unwrap();
    sleep(Duration::from_millis(100)).await;
    let listener = bind_listener(&offshore_addr.to_string()).await.unwrap();
    let (_, _offshore_shutdown2, _offshore2) = spawn_offshore_on(listener);

    let res = client
        .get(format!("http://{origin_addr}/after"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.text().await.unwrap(), "origin GET /after");
}

/// Killing the offshore relay mid-tunnel closes the user-agent socket;
/// after a restart the next request succeeds.
#[tokio::test]
async fn link_drop_mid_tunnel_closes_user_agent() {
    init_tracing();
    let (origin_addr, _origin) = spawn_origin_server("origin").await;
    let (echo_addr, _echo) = spawn_echo_server().await;
    let (offshore_addr, offshore_shutdown, offshore_task) = spawn_offshore().await;
    let (proxy_addr, _ship) = spawn_ship(offshore_addr).await;

    let (mut stream, status, _leftover) = open_connect_tunnel(proxy_addr, echo_addr).await;
    assert_eq!(status, 200);
    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, b"ping");

    offshore_shutdown.cancel();
    offshore_task.await.unwrap().unwrap();

    // the ship tears the tunnel down silently
    let mut rest = Vec::new();
    let closed = timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
    assert!(closed.is_ok(), "tunnel socket was not closed after link drop");

    // service resumes once the relay is back
    let listener = bind_listener(&offshore_addr.to_string()).await.unwrap();
    let (_, _offshore_shutdown2, _offshore2) = spawn_offshore_on(listener);
    let client = proxied_client(proxy_addr);
    let res = client
        .get(format!("http://{origin_addr}/recovered"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.text().await.unwrap(), "origin GET /recovered");
}

mod origin_server {
    use std::{convert::Infallible, time::Duration};

    use http_body_util::{BodyExt, Full};
    use hyper::{Request, Response, body::Bytes, server::conn::http1, service::service_fn};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    /// Returns "{label} {METHOD} {PATH}" as the response body; "/slow"
    /// sleeps before answering.
    pub(super) async fn run(listener: TcpListener, label: &'static str) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            tokio::task::spawn(async move {
                let handler = move |req: Request<hyper::body::Incoming>| async move {
                    let path = req.uri().path().to_owned();
                    if path == "/slow" {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    let body = format!("{label} {} {path}", req.method());
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                };
                let _ = http1::Builder::new()
                    .serve_connection(io, service_fn(handler))
                    .await;
            });
        }
    }

    /// Returns "{label} {METHOD} {PATH}: {BODY}" as the response body.
    pub(super) async fn run_echo_body(listener: TcpListener, label: &'static str) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            tokio::task::spawn(async move {
                let handler = move |req: Request<hyper::body::Incoming>| async move {
                    let method = req.method().clone();
                    let path = req.uri().path().to_string();
                    let body_bytes = req.collect().await.unwrap().to_bytes();
                    let body_str = String::from_utf8_lossy(&body_bytes);
                    let response = format!("{label} {method} {path}: {body_str}");
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(response))))
                };
                let _ = http1::Builder::new()
                    .serve_connection(io, service_fn(handler))
                    .await;
            });
        }
    }

    /// Reports whether the `x-foo` header arrived.
    pub(super) async fn run_header_probe(listener: TcpListener) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            tokio::task::spawn(async move {
                let handler = |req: Request<hyper::body::Incoming>| async move {
                    let seen = if req.headers().contains_key("x-foo") {
                        "present"
                    } else {
                        "absent"
                    };
                    let body = format!("x-foo={seen}");
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                };
                let _ = http1::Builder::new()
                    .serve_connection(io, service_fn(handler))
                    .await;
            });
        }
    }
}
