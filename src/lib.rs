//! # splitnet
//!
//! A resilient transport core for VPN-style tunnels.
//!
//! `splitnet` keeps DNS and TLS connections working on networks that block
//! by inspecting the first packet of a connection. Outbound HTTPS is dialed
//! with a split-retry stream that replays a failed ClientHello in two TCP
//! segments, DNS goes over HTTPS with RFC 7830 padding, and connections that
//! needed a retry are reported anonymously back over that same DNS channel.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use splitnet::doh::{DohTransport, Transport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = DohTransport::builder("https://dns.google/dns-query")
//!         .fallback_addrs(["8.8.8.8", "8.8.4.4"])
//!         .build()
//!         .await?;
//!     let response = transport.query(&query).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error definitions
//! - [`dns`] - Hostname resolution for DoH server bootstrap
//! - [`socket`] - Dialing and split-retry streams
//! - [`tls`] - TLS connector configuration and SNI extraction
//! - [`doh`] - DNS-over-HTTPS transport and its DNS-over-TCP front end
//! - [`report`] - Failure reporting over DNS
//! - [`tunnel`] - Tracked TCP streams for the tunnel

pub mod base;
pub mod dns;
pub mod doh;
pub mod report;
pub mod socket;
pub mod tls;
pub mod tunnel;
