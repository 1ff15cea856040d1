//! Ergonomic error context helpers.
//!
//! Extension traits that turn bare IO failures into `NetError` variants
//! carrying the peer or domain involved.

use crate::base::neterror::NetError;
use std::io;
use std::net::SocketAddr;

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Add connection context for the peer at `addr` to an IO error.
    ///
    /// # Example
    /// ```ignore
    /// use splitnet::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).await.addr_context(addr)?;
    /// // Error: "Connection to 192.0.2.1:443 failed: connection refused"
    /// ```
    fn addr_context(self, addr: SocketAddr) -> Result<T, NetError>;

    /// Add DNS resolution context to an IO error.
    fn dns_context(self, domain: &str) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn addr_context(self, addr: SocketAddr) -> Result<T, NetError> {
        self.map_err(|e| NetError::connection_failed_to(&addr.ip().to_string(), addr.port(), e))
    }

    fn dns_context(self, domain: &str) -> Result<T, NetError> {
        self.map_err(|e| NetError::dns_failed(domain, e))
    }
}
