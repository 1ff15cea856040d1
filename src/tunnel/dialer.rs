//! Outbound TCP for the tunnel.
//!
//! Streams to the fake DNS address are answered in-process by the DoH
//! front end. HTTPS streams go through the split-retry dialer, everything
//! else is dialed directly. All real connections are tracked.

use crate::doh::accept::accept;
use crate::doh::transport::Transport;
use crate::report::reporter::FailureReporter;
use crate::report::store::FileStore;
use crate::socket::dial::Dial;
use crate::socket::retrier::{dial_with_split_retry, SplitRetryConfig};
use crate::tunnel::tcp::{TcpListener, TrackedStream};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

const DNS_PIPE_CAPACITY: usize = 64 * 1024;

/// A stream returned by [`TunnelDialer::dial`].
#[derive(Debug)]
pub enum TunnelStream {
    /// In-process DNS-over-TCP served by the current [`Transport`].
    Dns(DuplexStream),
    Tcp(TrackedStream),
}

/// Dials TCP on behalf of tunneled apps.
pub struct TunnelDialer {
    fake_dns: SocketAddr,
    dns: RwLock<Arc<dyn Transport>>,
    dialer: Arc<dyn Dial>,
    retry: SplitRetryConfig,
    listener: Option<Arc<dyn TcpListener>>,
    reporter: FailureReporter,
}

impl TunnelDialer {
    pub fn new(fake_dns: SocketAddr, dns: Arc<dyn Transport>, dialer: Arc<dyn Dial>) -> Self {
        let reporter = FailureReporter::default();
        reporter.set_dns(Some(dns.clone()));
        Self {
            fake_dns,
            dns: RwLock::new(dns),
            dialer,
            retry: SplitRetryConfig::default(),
            listener: None,
            reporter,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TcpListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_retry_config(mut self, retry: SplitRetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_reporter(mut self, reporter: FailureReporter) -> Self {
        reporter.set_dns(Some(self.dns()));
        self.reporter = reporter;
        self
    }

    /// The transport currently answering DNS.
    pub fn dns(&self) -> Arc<dyn Transport> {
        self.dns.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Swaps the DNS transport. Streams already open keep the old one.
    pub fn set_dns(&self, dns: Arc<dyn Transport>) {
        self.reporter.set_dns(Some(dns.clone()));
        *self.dns.write().unwrap_or_else(|e| e.into_inner()) = dns;
    }

    pub fn reporter(&self) -> &FailureReporter {
        &self.reporter
    }

    /// Turns on failure reporting with its state kept at `path`.
    pub fn enable_reporter(
        &self,
        path: impl AsRef<Path>,
        suffix: &str,
        country: &str,
    ) -> io::Result<()> {
        self.reporter.configure(&FileStore::new(path.as_ref()), suffix, country)
    }

    pub async fn dial(&self, dest: SocketAddr) -> io::Result<TunnelStream> {
        if same_endpoint(dest, self.fake_dns) {
            let (client, server) = tokio::io::duplex(DNS_PIPE_CAPACITY);
            tokio::spawn(accept(self.dns(), server));
            return Ok(TunnelStream::Dns(client));
        }

        let before = Instant::now();
        if dest.port() == 443 {
            let stream = dial_with_split_retry(self.dialer.clone(), dest, self.retry.clone()).await?;
            let synack = before.elapsed();
            return Ok(TunnelStream::Tcp(TrackedStream::retrying(
                stream,
                synack,
                self.listener.clone(),
                Some(self.reporter.clone()),
            )));
        }

        let stream = self.dialer.dial(dest).await?;
        let synack = before.elapsed();
        Ok(TunnelStream::Tcp(TrackedStream::direct(stream, synack, self.listener.clone())?))
    }
}

impl fmt::Debug for TunnelDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelDialer")
            .field("fake_dns", &self.fake_dns)
            .field("dns", &self.dns().url())
            .field("reporter", &self.reporter)
            .finish()
    }
}

/// Compares endpoints, treating IPv4-mapped IPv6 addresses as IPv4.
fn same_endpoint(a: SocketAddr, b: SocketAddr) -> bool {
    a.port() == b.port() && a.ip().to_canonical() == b.ip().to_canonical()
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Dns(s) => Pin::new(s).poll_read(cx, buf),
            TunnelStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TunnelStream::Dns(s) => Pin::new(s).poll_write(cx, buf),
            TunnelStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Dns(s) => Pin::new(s).poll_flush(cx),
            TunnelStream::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Dns(s) => Pin::new(s).poll_shutdown(cx),
            TunnelStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
