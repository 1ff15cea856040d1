//! Split-retry TCP streams.
//!
//! A [`SplitRetryStream`] looks like an ordinary TCP connection, but until the
//! server's first reply arrives it is *provisional*: every byte written is
//! remembered, and if the connection then fails (reset, FIN, or no reply
//! within the hello timeout) it is transparently replaced by a new connection
//! to the same address on which the remembered bytes are replayed, split at a
//! random offset into two TCP segments. Middleboxes that match a TLS SNI within
//! a single packet do not see it on the second attempt.
//!
//! The first read result, success or failure, finalizes the stream. At most
//! one retry happens per stream.

use crate::socket::dial::Dial;
use crate::socket::flag::Flag;
use crate::tls::sni::extract_sni;
use bytes::{Buf, BytesMut};
use rand::Rng;
use socket2::SockRef;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;

/// Largest first flight kept for replay. A stream that writes more before the
/// first reply is finalized on its current connection and never retried.
pub const MAX_HELLO_LEN: usize = 64 * 1024;

/// Tuning for the split-retry dialer.
#[derive(Debug, Clone)]
pub struct SplitRetryConfig {
    /// Smallest first segment when splitting the hello.
    pub min_split: usize,
    /// Largest first segment when splitting the hello.
    pub max_split: usize,
    /// Fixed part of the hello reply timeout.
    pub base_timeout: Duration,
    /// The reply timeout adds this many handshake round trips.
    pub rtt_multiplier: u32,
    /// Split the very first write, not only the replayed hello.
    pub split_first_write: bool,
}

impl Default for SplitRetryConfig {
    fn default() -> Self {
        Self {
            min_split: 32,
            max_split: 64,
            base_timeout: Duration::from_millis(1200),
            rtt_multiplier: 2,
            split_first_write: true,
        }
    }
}

impl SplitRetryConfig {
    pub fn with_split_range(mut self, min: usize, max: usize) -> Self {
        self.min_split = min.min(max);
        self.max_split = max.max(min);
        self
    }

    pub fn with_base_timeout(mut self, timeout: Duration) -> Self {
        self.base_timeout = timeout;
        self
    }

    pub fn with_rtt_multiplier(mut self, multiplier: u32) -> Self {
        self.rtt_multiplier = multiplier;
        self
    }

    pub fn with_split_first_write(mut self, split: bool) -> Self {
        self.split_first_write = split;
        self
    }

    /// Reply timeout for a connection whose handshake took `rtt`.
    pub fn hello_timeout(&self, rtt: Duration) -> Duration {
        self.base_timeout + rtt * self.rtt_multiplier
    }
}

/// What happened while a stream was provisional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// TLS SNI seen in the written bytes, empty if none was parsed.
    pub sni: String,
    /// Bytes written before the first reply.
    pub bytes: usize,
    /// Write calls before the first reply.
    pub chunks: usize,
    /// Length of the first segment of the replayed hello, 0 if no retry.
    pub split: usize,
    /// The retry was triggered by the reply timeout rather than an error.
    pub timeout: bool,
}

impl RetryStats {
    pub fn retried(&self) -> bool {
        self.split > 0
    }
}

/// Splits `hello` at a random offset in `[min, max]`, clamped to half its length.
pub fn split_hello(hello: &[u8], min: usize, max: usize) -> (&[u8], &[u8]) {
    if hello.is_empty() {
        return (hello, hello);
    }
    let s = rand::thread_rng().gen_range(min..=max.max(min));
    hello.split_at(s.min(hello.len() / 2))
}

/// Dials `addr` and wraps the connection in a [`SplitRetryStream`].
///
/// The initial dial is not retried; its failure is returned directly.
pub async fn dial_with_split_retry(
    dialer: Arc<dyn Dial>,
    addr: SocketAddr,
    config: SplitRetryConfig,
) -> io::Result<SplitRetryStream> {
    let before = Instant::now();
    let conn = dialer.dial(addr).await?;
    let rtt = before.elapsed();
    let hello_timeout = config.hello_timeout(rtt);
    tracing::debug!(%addr, ?rtt, ?hello_timeout, "split-retry connection established");

    let (read_deadline, _) = watch::channel(None);
    let (write_deadline, _) = watch::channel(None);
    let inner = Inner {
        dialer,
        raddr: addr,
        config,
        hello_timeout,
        state: tokio::sync::Mutex::new(Provisional {
            conn: Arc::new(conn),
            hello: Vec::new(),
        }),
        final_conn: OnceLock::new(),
        stats: Mutex::new(RetryStats::default()),
        retry_complete: Flag::new(),
        read_closed: Flag::new(),
        write_closed: Flag::new(),
        deadlines: Mutex::new(Deadlines::default()),
        read_deadline,
        write_deadline,
    };
    Ok(SplitRetryStream::from_inner(Arc::new(inner)))
}

struct Provisional {
    conn: Arc<TcpStream>,
    hello: Vec<u8>,
}

/// Deadlines requested by the caller.
#[derive(Debug, Default, Clone, Copy)]
struct Deadlines {
    read: Option<Instant>,
    write: Option<Instant>,
}

struct Inner {
    dialer: Arc<dyn Dial>,
    raddr: SocketAddr,
    config: SplitRetryConfig,
    hello_timeout: Duration,
    /// Guards the connection and hello buffer until finalization.
    state: tokio::sync::Mutex<Provisional>,
    /// Set exactly once, before `retry_complete` closes.
    final_conn: OnceLock<Arc<TcpStream>>,
    stats: Mutex<RetryStats>,
    retry_complete: Flag,
    read_closed: Flag,
    write_closed: Flag,
    deadlines: Mutex<Deadlines>,
    /// Deadline enforced on reads: the hello timeout while provisional, the
    /// caller's read deadline afterwards.
    read_deadline: watch::Sender<Option<Instant>>,
    write_deadline: watch::Sender<Option<Instant>>,
}

impl Inner {
    fn stats(&self) -> std::sync::MutexGuard<'_, RetryStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deadlines(&self) -> std::sync::MutexGuard<'_, Deadlines> {
        self.deadlines.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn current_conn(&self) -> Arc<TcpStream> {
        if let Some(conn) = self.final_conn.get() {
            return conn.clone();
        }
        self.state.lock().await.conn.clone()
    }

    /// Writes `buf` to the provisional connection, recording what was sent.
    ///
    /// Returns how many bytes reached the socket and the error, if any, that
    /// stopped the write.
    async fn write_provisional(
        &self,
        state: &mut Provisional,
        buf: &[u8],
    ) -> (usize, io::Result<()>) {
        let first_write = state.hello.is_empty();
        let (head, tail) = if first_write && self.config.split_first_write {
            split_hello(buf, self.config.min_split, self.config.max_split)
        } else {
            (buf, &buf[buf.len()..])
        };

        let mut written = 0;
        let mut result = Ok(());
        for segment in [head, tail] {
            if segment.is_empty() {
                continue;
            }
            match write_all(&state.conn, segment, self.write_deadline.subscribe()).await {
                (n, Ok(())) => written += n,
                (n, Err(e)) => {
                    written += n;
                    result = Err(e);
                    break;
                }
            }
        }

        state.hello.extend_from_slice(&buf[..written]);
        let mut stats = self.stats();
        stats.chunks += 1;
        stats.bytes = state.hello.len();
        if stats.sni.is_empty() {
            if let Some(sni) = extract_sni(&state.hello) {
                stats.sni = sni;
            }
        }
        drop(stats);

        // A reply, or another write, is required within the hello timeout.
        self.read_deadline
            .send_replace(Some(Instant::now() + self.hello_timeout));
        (written, result)
    }

    /// Replaces the provisional connection and replays the hello on it.
    async fn retry(&self, state: &mut Provisional) -> io::Result<()> {
        let _ = SockRef::from(&*state.conn).shutdown(Shutdown::Both);

        let conn = Arc::new(self.dialer.dial(self.raddr).await?);
        state.conn = conn.clone();

        let (first, second) = split_hello(&state.hello, self.config.min_split, self.config.max_split);
        self.stats().split = first.len();
        tracing::debug!(
            addr = %self.raddr,
            split = first.len(),
            bytes = state.hello.len(),
            "replaying hello on new connection"
        );
        for segment in [first, second] {
            if segment.is_empty() {
                continue;
            }
            let (_, result) = write_all(&conn, segment, self.write_deadline.subscribe()).await;
            result?;
        }

        // The caller may have half-closed the old connection meanwhile.
        let sock = SockRef::from(&*conn);
        if self.read_closed.is_closed() {
            sock.shutdown(Shutdown::Read)?;
        }
        if self.write_closed.is_closed() {
            sock.shutdown(Shutdown::Write)?;
        }
        Ok(())
    }

    /// Freezes the current connection. Must be called with `state` locked.
    fn finalize(&self, state: &mut Provisional) {
        let _ = self.final_conn.set(state.conn.clone());
        let read = self.deadlines().read;
        self.read_deadline.send_replace(read);
        state.hello = Vec::new();
        self.retry_complete.close();
    }
}

/// A TCP stream that retries its first flight once on early failure.
///
/// Clones share the same logical connection, so one clone can read while
/// another writes.
pub struct SplitRetryStream {
    inner: Arc<Inner>,
    // Only touched through `&mut self`; the mutex keeps the stream `Sync`.
    io: Mutex<PollState>,
}

type ReadFuture = Pin<Box<dyn Future<Output = io::Result<BytesMut>> + Send>>;
type WriteFuture = Pin<Box<dyn Future<Output = io::Result<usize>> + Send>>;
type ShutdownFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// In-flight operations for the `AsyncRead`/`AsyncWrite` adapters.
#[derive(Default)]
struct PollState {
    read: Option<ReadFuture>,
    leftover: BytesMut,
    write: Option<WriteFuture>,
    shutdown: Option<ShutdownFuture>,
}

impl SplitRetryStream {
    fn from_inner(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            io: Mutex::default(),
        }
    }

    /// Snapshot of the retry statistics.
    pub fn stats(&self) -> RetryStats {
        self.inner.stats().clone()
    }

    /// Returns true once the stream is past its provisional phase.
    pub fn is_finalized(&self) -> bool {
        self.inner.retry_complete.is_closed()
    }

    /// Reads into `buf`, finalizing the stream on the first result.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let inner = &self.inner;
        if let Some(conn) = inner.final_conn.get() {
            return read_some(conn, buf, inner.read_deadline.subscribe()).await;
        }

        let conn = inner.state.lock().await.conn.clone();
        let result = read_some(&conn, buf, inner.read_deadline.subscribe()).await;

        if inner.retry_complete.is_closed() {
            return result;
        }
        let mut state = inner.state.lock().await;
        if inner.retry_complete.is_closed() {
            return result;
        }

        // EOF counts as a failure unless the caller shut the read side itself.
        let failure = match result {
            Ok(0) if !inner.read_closed.is_closed() => io::Error::from(io::ErrorKind::UnexpectedEof),
            Err(e) if !inner.read_closed.is_closed() => e,
            result => {
                inner.finalize(&mut state);
                return result;
            }
        };

        let timed_out = failure.kind() == io::ErrorKind::TimedOut;
        inner.stats().timeout = timed_out;
        tracing::debug!(
            addr = %inner.raddr,
            error = %failure,
            timeout = timed_out,
            "provisional connection failed, retrying"
        );
        let retried = inner.retry(&mut state).await;
        inner.finalize(&mut state);
        drop(state);

        match retried {
            Ok(()) => {
                let conn = inner.current_conn().await;
                read_some(&conn, buf, inner.read_deadline.subscribe()).await
            }
            Err(e) => {
                tracing::debug!(addr = %inner.raddr, error = %e, "retry failed");
                Err(e)
            }
        }
    }

    /// Writes from `buf`. Provisional writes are buffered for replay.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let inner = &self.inner;
        if !inner.retry_complete.is_closed() {
            let mut attempt = None;
            {
                let mut state = inner.state.lock().await;
                if !inner.retry_complete.is_closed() {
                    if state.hello.len() + buf.len() > MAX_HELLO_LEN {
                        tracing::debug!(
                            addr = %inner.raddr,
                            buffered = state.hello.len(),
                            len = buf.len(),
                            "first flight too large to replay, finalizing"
                        );
                        inner.finalize(&mut state);
                    } else {
                        attempt = Some(inner.write_provisional(&mut state, buf).await);
                    }
                }
            }
            if let Some((n, result)) = attempt {
                match result {
                    Ok(()) => return Ok(n),
                    Err(e) => {
                        // The retry replays buf[..n]; only the rest is ours to send.
                        tracing::debug!(error = %e, written = n, "provisional write failed, awaiting retry");
                        inner.retry_complete.wait().await;
                        let conn = inner.current_conn().await;
                        let (m, result) =
                            write_all(&conn, &buf[n..], inner.write_deadline.subscribe()).await;
                        result?;
                        return Ok(n + m);
                    }
                }
            }
        }

        let conn = inner.current_conn().await;
        write_some(&conn, buf, inner.write_deadline.subscribe()).await
    }

    /// Writes all of `buf`.
    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Shuts down the read half. Idempotent.
    pub async fn close_read(&self) -> io::Result<()> {
        self.inner.read_closed.close();
        let conn = self.inner.current_conn().await;
        ignore_not_connected(SockRef::from(&*conn).shutdown(Shutdown::Read))
    }

    /// Shuts down the write half. Idempotent.
    pub async fn close_write(&self) -> io::Result<()> {
        self.inner.write_closed.close();
        let conn = self.inner.current_conn().await;
        ignore_not_connected(SockRef::from(&*conn).shutdown(Shutdown::Write))
    }

    /// Shuts down both halves.
    pub async fn close(&self) -> io::Result<()> {
        self.inner.read_closed.close();
        self.inner.write_closed.close();
        let conn = self.inner.current_conn().await;
        ignore_not_connected(SockRef::from(&*conn).shutdown(Shutdown::Both))
    }

    pub fn read_closed(&self) -> bool {
        self.inner.read_closed.is_closed()
    }

    pub fn write_closed(&self) -> bool {
        self.inner.write_closed.is_closed()
    }

    /// Local address of the current physical connection; may change on retry.
    pub async fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.current_conn().await.local_addr()
    }

    /// The address originally dialed, stable across retries.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.raddr
    }

    /// Sets the read deadline. While provisional it is recorded and applied
    /// once the stream is finalized.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.deadlines().read = deadline;
        if self.inner.retry_complete.is_closed() {
            self.inner.read_deadline.send_replace(deadline);
        }
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.inner.deadlines().write = deadline;
        self.inner.write_deadline.send_replace(deadline);
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }
}

impl Clone for SplitRetryStream {
    fn clone(&self) -> Self {
        Self::from_inner(self.inner.clone())
    }
}

impl fmt::Debug for SplitRetryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitRetryStream")
            .field("remote_addr", &self.inner.raddr)
            .field("finalized", &self.is_finalized())
            .field("stats", &self.stats())
            .finish()
    }
}

impl AsyncRead for SplitRetryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let pending = this.io.get_mut().unwrap_or_else(|e| e.into_inner());
        if !pending.leftover.is_empty() {
            let n = pending.leftover.len().min(buf.remaining());
            buf.put_slice(&pending.leftover[..n]);
            pending.leftover.advance(n);
            return Poll::Ready(Ok(()));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let fut = pending.read.get_or_insert_with(|| {
            let stream = this.inner.clone();
            let len = buf.remaining();
            Box::pin(async move {
                let mut data = BytesMut::zeroed(len);
                let n = SplitRetryStream::from_inner(stream).read(&mut data).await?;
                data.truncate(n);
                Ok(data)
            })
        });
        let result = ready!(fut.as_mut().poll(cx));
        pending.read = None;

        let mut data = result?;
        let n = data.len().min(buf.remaining());
        buf.put_slice(&data[..n]);
        data.advance(n);
        pending.leftover = data;
        Poll::Ready(Ok(()))
    }
}

/// A write that returns `Pending` must be retried with the same buffer: the
/// bytes are captured on the first poll and sent as one unit.
impl AsyncWrite for SplitRetryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let pending = this.io.get_mut().unwrap_or_else(|e| e.into_inner());
        let fut = pending.write.get_or_insert_with(|| {
            let stream = this.inner.clone();
            let data = buf.to_vec();
            Box::pin(async move {
                SplitRetryStream::from_inner(stream).write_all(&data).await?;
                Ok(data.len())
            })
        });
        let result = ready!(fut.as_mut().poll(cx));
        pending.write = None;
        // Never report more than the caller offered on this poll.
        Poll::Ready(result.map(|n| n.min(buf.len())))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let pending = this.io.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(fut) = pending.write.as_mut() {
            let result = ready!(fut.as_mut().poll(cx));
            pending.write = None;
            result?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        let this = self.get_mut();
        let pending = this.io.get_mut().unwrap_or_else(|e| e.into_inner());
        let fut = pending.shutdown.get_or_insert_with(|| {
            let stream = this.inner.clone();
            Box::pin(async move { SplitRetryStream::from_inner(stream).close_write().await })
        });
        let result = ready!(fut.as_mut().poll(cx));
        pending.shutdown = None;
        Poll::Ready(result)
    }
}

fn ignore_not_connected(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded")
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Reads once from `conn`, failing with `TimedOut` if the deadline carried by
/// `deadline` passes first. The deadline may move while the read is pending.
async fn read_some(
    conn: &TcpStream,
    buf: &mut [u8],
    mut deadline: watch::Receiver<Option<Instant>>,
) -> io::Result<usize> {
    let mut watching = true;
    loop {
        let current = *deadline.borrow_and_update();
        tokio::select! {
            result = try_read(conn, buf) => return result,
            _ = sleep_until(current) => return Err(deadline_exceeded()),
            changed = deadline.changed(), if watching => watching = changed.is_ok(),
        }
    }
}

async fn try_read(conn: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        conn.readable().await?;
        match conn.try_read(buf) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            result => return result,
        }
    }
}

async fn write_some(
    conn: &TcpStream,
    buf: &[u8],
    mut deadline: watch::Receiver<Option<Instant>>,
) -> io::Result<usize> {
    let mut watching = true;
    loop {
        let current = *deadline.borrow_and_update();
        tokio::select! {
            result = try_write(conn, buf) => return result,
            _ = sleep_until(current) => return Err(deadline_exceeded()),
            changed = deadline.changed(), if watching => watching = changed.is_ok(),
        }
    }
}

async fn try_write(conn: &TcpStream, buf: &[u8]) -> io::Result<usize> {
    loop {
        conn.writable().await?;
        match conn.try_write(buf) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            result => return result,
        }
    }
}

/// Writes all of `buf`, reporting progress even when it fails partway.
async fn write_all(
    conn: &TcpStream,
    buf: &[u8],
    deadline: watch::Receiver<Option<Instant>>,
) -> (usize, io::Result<()>) {
    let mut written = 0;
    while written < buf.len() {
        match write_some(conn, &buf[written..], deadline.clone()).await {
            Ok(0) => return (written, Err(io::ErrorKind::WriteZero.into())),
            Ok(n) => written += n,
            Err(e) => return (written, Err(e)),
        }
    }
    (written, Ok(()))
}
