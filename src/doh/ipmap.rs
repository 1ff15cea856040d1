//! Candidate server addresses per hostname.
//!
//! An [`IpMap`] owns one [`IpSet`] per hostname. A set collects every address
//! seen for its host and remembers at most one that is *confirmed* to work,
//! which connection attempts try first.

use crate::dns::{Name, Resolve};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

/// Maps hostnames to their candidate sets.
pub struct IpMap {
    sets: DashMap<String, Arc<IpSet>>,
    resolver: Arc<dyn Resolve>,
}

impl IpMap {
    /// `resolver` is used for every hostname passed to [`get`](Self::get) or
    /// [`IpSet::add`].
    pub fn new(resolver: Arc<dyn Resolve>) -> Self {
        Self {
            sets: DashMap::new(),
            resolver,
        }
    }

    /// Returns the set for `hostname`, creating it by resolving the hostname on
    /// first use.
    ///
    /// Concurrent first calls for the same hostname all get the same set.
    pub async fn get(&self, hostname: &str) -> Arc<IpSet> {
        if let Some(set) = self.sets.get(hostname) {
            return set.clone();
        }

        // Resolve without holding a shard lock.
        let set = Arc::new(IpSet::new(self.resolver.clone()));
        set.add(hostname).await;

        self.sets
            .entry(hostname.to_string())
            .or_insert(set)
            .value()
            .clone()
    }

    /// Returns the set for `hostname` only if it already exists.
    pub fn peek(&self, hostname: &str) -> Option<Arc<IpSet>> {
        self.sets.get(hostname).map(|set| set.clone())
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl fmt::Debug for IpMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpMap").field("hosts", &self.sets.len()).finish()
    }
}

#[derive(Debug, Default)]
struct Candidates {
    ips: Vec<IpAddr>,
    confirmed: Option<IpAddr>,
}

impl Candidates {
    fn insert(&mut self, ip: IpAddr) {
        if !self.ips.contains(&ip) {
            self.ips.push(ip);
        }
    }
}

/// Unordered addresses for one host, at most one of them confirmed.
///
/// The confirmed address, if any, is always a member of the set.
pub struct IpSet {
    inner: RwLock<Candidates>,
    resolver: Arc<dyn Resolve>,
}

impl IpSet {
    fn new(resolver: Arc<dyn Resolve>) -> Self {
        Self {
            inner: RwLock::new(Candidates::default()),
            resolver,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Candidates> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Candidates> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolves `hostname` (a domain or an IP literal) and adds every result.
    ///
    /// Resolution failures are logged and otherwise ignored.
    pub async fn add(&self, hostname: &str) {
        match self.resolver.resolve(Name::new(hostname)).await {
            Ok(addrs) => {
                let resolved: Vec<IpAddr> = addrs.collect();
                tracing::debug!(hostname, count = resolved.len(), "adding resolved addresses");
                let mut inner = self.write();
                for ip in resolved {
                    inner.insert(ip);
                }
            }
            Err(e) => tracing::warn!(hostname, error = %e, "Failed to resolve"),
        }
    }

    /// Adds a single address.
    pub fn add_ip(&self, ip: IpAddr) {
        self.write().insert(ip);
    }

    pub fn is_empty(&self) -> bool {
        self.read().ips.is_empty()
    }

    pub fn len(&self) -> usize {
        self.read().ips.len()
    }

    /// All known addresses in random order.
    pub fn all(&self) -> Vec<IpAddr> {
        let mut ips = self.read().ips.clone();
        ips.shuffle(&mut rand::thread_rng());
        ips
    }

    pub fn confirmed(&self) -> Option<IpAddr> {
        self.read().confirmed
    }

    /// Marks `ip` as the confirmed address, adding it if necessary.
    pub fn confirm(&self, ip: IpAddr) {
        if self.confirmed() == Some(ip) {
            return;
        }
        let mut inner = self.write();
        inner.insert(ip);
        inner.confirmed = Some(ip);
    }

    /// Clears the confirmed address, but only if it is `ip`.
    pub fn disconfirm(&self, ip: IpAddr) {
        let mut inner = self.write();
        if inner.confirmed == Some(ip) {
            inner.confirmed = None;
        }
    }
}

impl fmt::Debug for IpSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.read();
        f.debug_struct("IpSet")
            .field("ips", &inner.ips)
            .field("confirmed", &inner.confirmed)
            .finish()
    }
}
