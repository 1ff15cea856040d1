//! Core DNS resolution types and traits.
//!
//! The DoH transport needs plain address resolution for exactly one thing:
//! turning its own endpoint hostname (and any fallback hostnames) into
//! candidate IPs. `Resolve` is the seam that lets the embedder supply a
//! resolver that bypasses the tunnel.

use crate::base::neterror::NetError;
use std::{
    collections::HashMap, fmt, future::Future, net::IpAddr, pin::Pin, sync::Arc,
};

/// A domain name to resolve into IP addresses.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    /// Creates a new [`Name`] from any string-like type.
    #[inline]
    pub fn new(host: impl Into<Box<str>>) -> Self {
        Self { host: host.into() }
    }

    /// View the hostname as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value)
    }
}

impl From<String> for Name {
    fn from(value: String) -> Self {
        Name::new(value)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// Alias for an `Iterator` trait object over resolved IPs.
pub type Addrs = Box<dyn Iterator<Item = IpAddr> + Send>;

/// Alias for the `Future` type returned by a DNS resolver.
pub type Resolving = Pin<Box<dyn Future<Output = Result<Addrs, NetError>> + Send>>;

/// Trait for DNS resolution.
///
/// Implementations must be thread-safe; resolution runs concurrently for
/// every query that discovers a new hostname.
pub trait Resolve: Send + Sync {
    /// Resolves a domain name (or IP literal) to IP addresses.
    fn resolve(&self, name: Name) -> Resolving;
}

impl<R: Resolve + ?Sized> Resolve for Arc<R> {
    fn resolve(&self, name: Name) -> Resolving {
        (**self).resolve(name)
    }
}

/// Resolver answering from a fixed hostname table, optionally falling back
/// to another resolver for names it does not know.
///
/// # Example
///
/// ```rust,ignore
/// use splitnet::dns::{GaiResolver, StaticResolver};
///
/// let resolver = StaticResolver::new()
///     .with_host("dns.example", ["192.0.2.1".parse()?])
///     .with_fallback(Arc::new(GaiResolver::new()));
/// ```
#[derive(Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
    fallback: Option<Arc<dyn Resolve>>,
}

impl StaticResolver {
    /// Creates an empty table with no fallback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the addresses for `host`.
    pub fn with_host(
        mut self,
        host: impl Into<String>,
        ips: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        self.hosts.insert(host.into(), ips.into_iter().collect());
        self
    }

    /// Resolver used for hostnames missing from the table.
    pub fn with_fallback(mut self, fallback: Arc<dyn Resolve>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Returns the number of configured hostnames.
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

impl Resolve for StaticResolver {
    fn resolve(&self, name: Name) -> Resolving {
        if let Some(ips) = self.hosts.get(name.as_str()) {
            let addrs: Addrs = Box::new(ips.clone().into_iter());
            return Box::pin(std::future::ready(Ok(addrs)));
        }
        if let Ok(ip) = name.as_str().parse::<IpAddr>() {
            let addrs: Addrs = Box::new(std::iter::once(ip));
            return Box::pin(std::future::ready(Ok(addrs)));
        }
        match &self.fallback {
            Some(fallback) => fallback.resolve(name),
            None => Box::pin(std::future::ready(Err(NetError::NoAddresses(
                name.as_str().to_string(),
            )))),
        }
    }
}

impl fmt::Debug for StaticResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticResolver")
            .field("host_count", &self.hosts.len())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}
