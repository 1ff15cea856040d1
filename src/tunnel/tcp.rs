//! Per-connection accounting for tunneled TCP streams.

use crate::report::reporter::FailureReporter;
use crate::socket::flag::Flag;
use crate::socket::retrier::{RetryStats, SplitRetryStream};
use socket2::SockRef;
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Information about a TCP stream, reported when it closes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TcpSocketSummary {
    pub download_bytes: u64,
    pub upload_bytes: u64,
    pub duration: Duration,
    /// The server port. Anything other than 0, 80 or 443 is reported as -1.
    pub server_port: i16,
    /// TCP handshake latency.
    pub synack: Duration,
    /// Present if the stream could retry; `split` is nonzero if it did.
    pub retry: Option<RetryStats>,
}

impl TcpSocketSummary {
    pub fn new(port: u16) -> Self {
        Self { server_port: server_port_label(port), ..Default::default() }
    }
}

fn server_port_label(port: u16) -> i16 {
    match port {
        0 => 0,
        80 => 80,
        443 => 443,
        _ => -1,
    }
}

/// Notified when a tracked stream closes.
pub trait TcpListener: Send + Sync {
    fn on_tcp_socket_closed(&self, summary: &TcpSocketSummary);
}

enum Conn {
    Retrying(SplitRetryStream),
    Direct(TcpStream),
}

struct Tracker {
    begin: Instant,
    server_port: i16,
    synack: Duration,
    download: AtomicU64,
    upload: AtomicU64,
    read_done: Flag,
    write_done: Flag,
    reported: Flag,
    retry: Option<SplitRetryStream>,
    listener: Option<Arc<dyn TcpListener>>,
    reporter: Option<FailureReporter>,
}

impl Tracker {
    fn summary(&self) -> TcpSocketSummary {
        TcpSocketSummary {
            download_bytes: self.download.load(Ordering::Relaxed),
            upload_bytes: self.upload.load(Ordering::Relaxed),
            duration: self.begin.elapsed(),
            server_port: self.server_port,
            synack: self.synack,
            retry: self.retry.as_ref().map(SplitRetryStream::stats),
        }
    }

    fn done_reading(&self) {
        self.read_done.close();
        self.maybe_finish();
    }

    fn done_writing(&self) {
        self.write_done.close();
        self.maybe_finish();
    }

    fn maybe_finish(&self) {
        if !self.read_done.is_closed() || !self.write_done.is_closed() || !self.reported.close() {
            return;
        }
        let summary = self.summary();
        tracing::debug!(?summary, "TCP socket closed");
        if let Some(listener) = &self.listener {
            listener.on_tcp_socket_closed(&summary);
        }
        if let Some(reporter) = &self.reporter {
            reporter.report(&summary);
        }
    }
}

/// Wraps a tunneled TCP stream, counting bytes in both directions.
///
/// Once both halves are closed (or the stream is dropped) the summary goes to
/// the [`TcpListener`] and, for streams that could retry, to the
/// [`FailureReporter`].
pub struct TrackedStream {
    conn: Conn,
    tracker: Tracker,
}

impl TrackedStream {
    fn new(
        conn: Conn,
        port: u16,
        synack: Duration,
        listener: Option<Arc<dyn TcpListener>>,
        reporter: Option<FailureReporter>,
    ) -> Self {
        let retry = match &conn {
            Conn::Retrying(stream) => Some(stream.clone()),
            Conn::Direct(_) => None,
        };
        let tracker = Tracker {
            begin: Instant::now(),
            server_port: server_port_label(port),
            synack,
            download: AtomicU64::new(0),
            upload: AtomicU64::new(0),
            read_done: Flag::new(),
            write_done: Flag::new(),
            reported: Flag::new(),
            retry,
            listener,
            reporter,
        };
        Self { conn, tracker }
    }

    /// Tracks a split-retry stream.
    pub fn retrying(
        stream: SplitRetryStream,
        synack: Duration,
        listener: Option<Arc<dyn TcpListener>>,
        reporter: Option<FailureReporter>,
    ) -> Self {
        let port = stream.remote_addr().port();
        Self::new(Conn::Retrying(stream), port, synack, listener, reporter)
    }

    /// Tracks a plain TCP stream. Its summary has no retry stats.
    pub fn direct(
        stream: TcpStream,
        synack: Duration,
        listener: Option<Arc<dyn TcpListener>>,
    ) -> io::Result<Self> {
        let port = stream.peer_addr()?.port();
        Ok(Self::new(Conn::Direct(stream), port, synack, listener, None))
    }

    /// Current counters, as they would be reported now.
    pub fn summary(&self) -> TcpSocketSummary {
        self.tracker.summary()
    }

    pub async fn close_read(&self) -> io::Result<()> {
        let result = match &self.conn {
            Conn::Retrying(stream) => stream.close_read().await,
            Conn::Direct(stream) => shutdown(stream, Shutdown::Read),
        };
        self.tracker.done_reading();
        result
    }

    pub async fn close_write(&self) -> io::Result<()> {
        let result = match &self.conn {
            Conn::Retrying(stream) => stream.close_write().await,
            Conn::Direct(stream) => shutdown(stream, Shutdown::Write),
        };
        self.tracker.done_writing();
        result
    }

    pub async fn close(&self) -> io::Result<()> {
        let result = match &self.conn {
            Conn::Retrying(stream) => stream.close().await,
            Conn::Direct(stream) => shutdown(stream, Shutdown::Both),
        };
        self.tracker.read_done.close();
        self.tracker.done_writing();
        result
    }
}

fn shutdown(stream: &TcpStream, how: Shutdown) -> io::Result<()> {
    match SockRef::from(stream).shutdown(how) {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.tracker.read_done.close();
        self.tracker.done_writing();
    }
}

impl fmt::Debug for TrackedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedStream").field("summary", &self.summary()).finish()
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = match &mut this.conn {
            Conn::Retrying(stream) => ready!(Pin::new(stream).poll_read(cx, buf)),
            Conn::Direct(stream) => ready!(Pin::new(stream).poll_read(cx, buf)),
        };
        let n = buf.filled().len() - before;
        this.tracker.download.fetch_add(n as u64, Ordering::Relaxed);
        Poll::Ready(result)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = match &mut this.conn {
            Conn::Retrying(stream) => ready!(Pin::new(stream).poll_write(cx, buf)),
            Conn::Direct(stream) => ready!(Pin::new(stream).poll_write(cx, buf)),
        };
        if let Ok(n) = result {
            this.tracker.upload.fetch_add(n as u64, Ordering::Relaxed);
        }
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().conn {
            Conn::Retrying(stream) => Pin::new(stream).poll_flush(cx),
            Conn::Direct(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = match &mut this.conn {
            Conn::Retrying(stream) => ready!(Pin::new(stream).poll_shutdown(cx)),
            Conn::Direct(stream) => ready!(Pin::new(stream).poll_shutdown(cx)),
        };
        this.tracker.done_writing();
        Poll::Ready(result)
    }
}
