//! Tunnel-side TCP plumbing: byte accounting for tunneled streams and the
//! dialer that routes them.

pub mod dialer;
pub mod tcp;

pub use dialer::{TunnelDialer, TunnelStream};
pub use tcp::{TcpListener, TcpSocketSummary, TrackedStream};
