//! Candidate address set tests.

use futures::future::join_all;
use splitnet::dns::{Name, Resolve, Resolving, StaticResolver};
use splitnet::doh::IpMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// Resolves slowly, counting lookups.
struct SlowResolver {
    inner: StaticResolver,
    lookups: AtomicUsize,
}

impl Resolve for SlowResolver {
    fn resolve(&self, name: Name) -> Resolving {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let lookup = self.inner.resolve(name);
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            lookup.await
        })
    }
}

#[tokio::test]
async fn test_concurrent_get_returns_one_set() {
    let resolver = Arc::new(SlowResolver {
        inner: StaticResolver::new().with_host("dns.example", [ip("192.0.2.1"), ip("192.0.2.2")]),
        lookups: AtomicUsize::new(0),
    });
    let map = Arc::new(IpMap::new(resolver.clone()));

    let sets = join_all((0..8).map(|_| {
        let map = map.clone();
        async move { map.get("dns.example").await }
    }))
    .await;

    for set in &sets[1..] {
        assert!(Arc::ptr_eq(&sets[0], set));
    }
    assert_eq!(map.len(), 1);
    assert_eq!(sets[0].len(), 2);
    assert!(resolver.lookups.load(Ordering::SeqCst) >= 1);

    // Later calls hit the cache.
    let before = resolver.lookups.load(Ordering::SeqCst);
    map.get("dns.example").await;
    assert_eq!(resolver.lookups.load(Ordering::SeqCst), before);
}

#[tokio::test]
async fn test_unresolvable_host_gives_empty_set() {
    let map = IpMap::new(Arc::new(StaticResolver::new()));
    let set = map.get("nowhere.example").await;
    assert!(set.is_empty());
    assert!(set.all().is_empty());
    assert!(map.peek("nowhere.example").is_some());
    assert!(map.peek("other.example").is_none());

    set.add("198.51.100.7").await;
    assert_eq!(set.all(), vec![ip("198.51.100.7")]);
}

#[tokio::test]
async fn test_confirmation_lifecycle() {
    let map = IpMap::new(Arc::new(
        StaticResolver::new().with_host("dns.example", [ip("192.0.2.1"), ip("192.0.2.2")]),
    ));
    let set = map.get("dns.example").await;
    assert_eq!(set.confirmed(), None);

    set.confirm(ip("192.0.2.2"));
    assert_eq!(set.confirmed(), Some(ip("192.0.2.2")));

    // Disconfirming some other address is a no-op.
    set.disconfirm(ip("192.0.2.1"));
    assert_eq!(set.confirmed(), Some(ip("192.0.2.2")));

    set.disconfirm(ip("192.0.2.2"));
    assert_eq!(set.confirmed(), None);

    // Confirming an unknown address adds it.
    set.confirm(ip("203.0.113.5"));
    assert_eq!(set.len(), 3);
    let all: HashSet<_> = set.all().into_iter().collect();
    assert!(all.contains(&ip("203.0.113.5")));
}

#[tokio::test]
async fn test_concurrent_confirm_and_disconfirm() {
    let map = IpMap::new(Arc::new(StaticResolver::new()));
    let set = map.get("192.0.2.1").await;
    assert_eq!(set.len(), 1);

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let set = set.clone();
            tokio::spawn(async move {
                let ip = IpAddr::from([192, 0, 2, (i % 4) as u8 + 1]);
                if i % 2 == 0 {
                    set.confirm(ip);
                } else {
                    set.disconfirm(ip);
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    // Whatever won, the confirmed address is a member.
    if let Some(confirmed) = set.confirmed() {
        assert!(set.all().contains(&confirmed));
    }
    assert!(set.len() <= 4);
}
