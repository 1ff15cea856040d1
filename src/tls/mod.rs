//! TLS helpers: connector configuration for the DoH client and ClientHello
//! inspection for the split-retry dialer.

pub mod config;
pub mod sni;

pub use config::{ClientAuth, TlsConfig};
pub use sni::extract_sni;
