//! Async DNS resolver using hickory-dns.
//!
//! Used when the embedder wants to resolve the DoH endpoint against specific
//! nameservers (for example the system resolvers reported by the platform)
//! instead of going through `getaddrinfo`.

use super::{Addrs, Name, Resolve, Resolving};
use crate::base::neterror::NetError;
use crate::dns::parse_ip_literal;
use hickory_resolver::{
    config::{LookupIpStrategy, NameServerConfigGroup, ResolverConfig},
    name_server::TokioConnectionProvider,
    TokioResolver,
};
use std::{net::IpAddr, sync::Arc};

/// Async DNS resolver backed by hickory-dns.
///
/// Cheap to clone; clones share the underlying resolver and its cache.
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: Arc<TokioResolver>,
}

impl HickoryResolver {
    /// Creates a resolver from the system configuration, falling back to
    /// hickory's defaults if it cannot be read.
    pub fn new() -> Self {
        let mut builder = match TokioResolver::builder_tokio() {
            Ok(builder) => {
                tracing::debug!("Using system DNS configuration");
                builder
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Failed to read system DNS config, using defaults"
                );
                TokioResolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
            }
        };
        builder.options_mut().ip_strategy = LookupIpStrategy::Ipv4AndIpv6;

        Self {
            resolver: Arc::new(builder.build()),
        }
    }

    /// Creates a resolver that queries the given nameservers over UDP/TCP
    /// port 53.
    pub fn with_nameservers(servers: &[IpAddr]) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(servers, 53, true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        let mut builder =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default());
        builder.options_mut().ip_strategy = LookupIpStrategy::Ipv4AndIpv6;

        Self {
            resolver: Arc::new(builder.build()),
        }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HickoryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HickoryResolver").finish_non_exhaustive()
    }
}

impl Resolve for HickoryResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.resolver.clone();
        Box::pin(async move {
            let domain = name.as_str();
            if let Some(ip) = parse_ip_literal(domain) {
                return Ok(Box::new(std::iter::once(ip)) as Addrs);
            }
            tracing::debug!(domain = %domain, "resolving via hickory-dns");

            let lookup = resolver.lookup_ip(domain).await.map_err(|e| {
                tracing::debug!(domain = %domain, error = %e, "hickory-dns lookup failed");
                NetError::dns_failed(
                    domain,
                    std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()),
                )
            })?;

            let ips: Vec<IpAddr> = lookup.iter().collect();
            if ips.is_empty() {
                return Err(NetError::NoAddresses(domain.to_string()));
            }

            tracing::debug!(domain = %domain, count = ips.len(), "hickory-dns resolution complete");
            Ok(Box::new(ips.into_iter()) as Addrs)
        })
    }
}
