//! Physical TCP dialing.
//!
//! `Dial` is the environment-supplied primitive every outbound connection goes
//! through. On a VPN client the transport's own sockets must not be routed back
//! into the tunnel, so the default implementation can be swapped for a
//! [`ProtectedDialer`] that hands each socket to the platform before
//! connecting.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};

/// Alias for the `Future` type returned by a dialer.
pub type Dialing = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

/// Opens physical TCP connections.
pub trait Dial: Send + Sync {
    fn dial(&self, addr: SocketAddr) -> Dialing;
}

impl<D: Dial + ?Sized> Dial for Arc<D> {
    fn dial(&self, addr: SocketAddr) -> Dialing {
        (**self).dial(addr)
    }
}

/// Plain TCP dialer with an optional connect timeout.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    connect_timeout: Option<Duration>,
}

impl TcpDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the dial with `TimedOut` if the handshake takes longer than `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

impl Dial for TcpDialer {
    fn dial(&self, addr: SocketAddr) -> Dialing {
        let connect_timeout = self.connect_timeout;
        Box::pin(async move { connect(new_socket(addr)?, addr, connect_timeout).await })
    }
}

/// Excludes a socket from the VPN's routing.
///
/// Wraps the platform call (Android's `VpnService.protect()` and friends).
pub trait Protect: Send + Sync {
    /// Returns false if the socket could not be protected.
    #[cfg(unix)]
    fn protect(&self, fd: std::os::fd::RawFd) -> bool;
    #[cfg(windows)]
    fn protect(&self, socket: std::os::windows::io::RawSocket) -> bool;
}

/// Dialer that protects every socket before connecting it.
pub struct ProtectedDialer {
    protector: Arc<dyn Protect>,
    connect_timeout: Option<Duration>,
}

impl ProtectedDialer {
    pub fn new(protector: Arc<dyn Protect>) -> Self {
        Self {
            protector,
            connect_timeout: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for ProtectedDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectedDialer")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl Dial for ProtectedDialer {
    fn dial(&self, addr: SocketAddr) -> Dialing {
        let protector = self.protector.clone();
        let connect_timeout = self.connect_timeout;
        Box::pin(async move {
            let socket = new_socket(addr)?;
            #[cfg(unix)]
            let protected = {
                use std::os::fd::AsRawFd;
                protector.protect(socket.as_raw_fd())
            };
            #[cfg(windows)]
            let protected = {
                use std::os::windows::io::AsRawSocket;
                protector.protect(socket.as_raw_socket())
            };
            if !protected {
                // The connection may still work; it will just loop through the tunnel.
                tracing::error!(%addr, "Failed to protect a tcp socket");
            }
            connect(socket, addr, connect_timeout).await
        })
    }
}

fn new_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_nodelay(true)?;
    Ok(socket)
}

async fn connect(
    socket: TcpSocket,
    addr: SocketAddr,
    connect_timeout: Option<Duration>,
) -> io::Result<TcpStream> {
    tracing::debug!(%addr, "dialing");
    let stream = match connect_timeout {
        Some(limit) => tokio::time::timeout(limit, socket.connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
        None => socket.connect(addr).await?,
    };
    Ok(stream)
}
