//! DNS Resolution Module
//!
//! Pluggable address resolution used to seed the DoH transport's candidate
//! IP sets:
//! - System resolver (getaddrinfo via thread pool)
//! - Async hickory-dns resolver against chosen nameservers
//! - Static hostname table with optional fallback
//!
//! # Example
//!
//! ```rust,ignore
//! use splitnet::dns::{GaiResolver, Name, Resolve};
//!
//! let resolver = GaiResolver::new();
//! for ip in resolver.resolve(Name::new("dns.google")).await? {
//!     println!("Resolved: {}", ip);
//! }
//! ```

mod gai;
mod hickory;
mod resolve;

pub use gai::{parse_ip_literal, GaiResolver};
pub use hickory::HickoryResolver;
pub use resolve::{Addrs, Name, Resolve, Resolving, StaticResolver};
