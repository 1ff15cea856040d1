//! DNS-over-HTTPS.
//!
//! - [`transport`]: the [`DohTransport`] and its [`Transport`] trait
//! - [`exchange`]: the HTTPS client underneath, swappable for tests
//! - [`ipmap`]: candidate server addresses with confirm/disconfirm feedback
//! - [`padding`]: RFC 7830 query padding
//! - [`accept`]: DNS-over-TCP front end
//!
//! # Example
//!
//! ```rust,ignore
//! use splitnet::doh::{DohTransport, Transport};
//!
//! let transport = DohTransport::builder("https://dns.google/dns-query")
//!     .fallback_addrs(["8.8.8.8", "8.8.4.4"])
//!     .build()
//!     .await?;
//! let response = match transport.query(&query).await {
//!     Ok(response) => response,
//!     Err(e) => e.into_response().unwrap_or_default(),
//! };
//! ```

pub mod accept;
pub mod error;
pub mod exchange;
pub mod ipmap;
pub mod message;
pub mod padding;
pub mod transport;

pub use accept::{accept, forward_query, ForwardError};
pub use error::{PaddingError, QueryError, QueryFailure, Status};
pub use exchange::{Exchange, ExchangeError, ExchangeResponse, Exchanging, HttpsExchange};
pub use ipmap::{IpMap, IpSet};
pub use message::{servfail, try_servfail};
pub use padding::{add_edns_padding, PADDING_BLOCK_SIZE};
pub use transport::{
    DohConfig, DohTransport, DohTransportBuilder, QueryListener, QuerySummary, QueryToken, Querying,
    Transport,
};
