//! Listener plumbing shared by the binaries.

use std::{io, net::SocketAddr};

use tokio::net::{TcpListener, TcpSocket};

/// Expands the `":port"` shorthand to an all-interfaces bind address.
pub fn listen_addr(raw: &str) -> String {
    match raw.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => raw.to_string(),
    }
}

/// Binds a listener with `SO_REUSEADDR` so a restarted process can rebind
/// its port promptly after a crash. Hostnames fall back to a plain bind.
pub async fn bind_listener(addr: &str) -> io::Result<TcpListener> {
    match addr.parse::<SocketAddr>() {
        Ok(addr) => {
            let socket = if addr.is_ipv6() {
                TcpSocket::new_v6()?
            } else {
                TcpSocket::new_v4()?
            };
            socket.set_reuseaddr(true)?;
            socket.bind(addr)?;
            socket.listen(1024)
        }
        Err(_) => TcpListener::bind(addr).await,
    }
}
