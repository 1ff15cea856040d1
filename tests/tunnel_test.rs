//! Tracked streams and tunnel dialing over loopback.

use splitnet::doh::{Querying, Transport};
use splitnet::report::{FailureReporter, MemoryStore};
use splitnet::socket::{dial_with_split_retry, Dial, SplitRetryConfig, TcpDialer};
use splitnet::tls::sni::client_hello_for;
use splitnet::tunnel::{TcpListener, TcpSocketSummary, TrackedStream, TunnelDialer, TunnelStream};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Default)]
struct RecordingListener {
    closed: Mutex<Vec<TcpSocketSummary>>,
}

impl RecordingListener {
    fn summaries(&self) -> Vec<TcpSocketSummary> {
        self.closed.lock().unwrap().clone()
    }
}

impl TcpListener for RecordingListener {
    fn on_tcp_socket_closed(&self, summary: &TcpSocketSummary) {
        self.closed.lock().unwrap().push(summary.clone());
    }
}

struct EchoTransport;

impl Transport for EchoTransport {
    fn query(&self, query: &[u8]) -> Querying {
        let mut response = query.to_vec();
        Box::pin(async move {
            response[2] |= 0x80;
            Ok(response)
        })
    }

    fn url(&self) -> &str {
        "https://dns.example/dns-query"
    }
}

fn dialer() -> Arc<dyn Dial> {
    Arc::new(TcpDialer::new())
}

/// Echo server. With `close_first_after`, the first connection is closed
/// once that many bytes have arrived, without echoing anything.
async fn spawn_echo(close_first_after: Option<usize>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut first = close_first_after;
        while let Ok((mut conn, _)) = listener.accept().await {
            let close_after = first.take();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut received = 0;
                loop {
                    let n = match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    received += n;
                    match close_after {
                        Some(limit) if received >= limit => return,
                        Some(_) => continue,
                        None => {}
                    }
                    if conn.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_direct_stream_summary() {
    let addr = spawn_echo(None).await;
    let listener = Arc::new(RecordingListener::default());
    let conn = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut stream =
        TrackedStream::direct(conn, Duration::from_millis(3), Some(listener.clone())).unwrap();

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    stream.close_read().await.unwrap();
    assert!(listener.summaries().is_empty(), "write side still open");
    stream.close_write().await.unwrap();

    let summaries = listener.summaries();
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.upload_bytes, 4);
    assert_eq!(summary.download_bytes, 4);
    assert_eq!(summary.server_port, -1);
    assert_eq!(summary.synack, Duration::from_millis(3));
    assert!(summary.retry.is_none());

    // Reported once, even when dropped afterwards.
    drop(stream);
    assert_eq!(listener.summaries().len(), 1);
}

#[tokio::test]
async fn test_drop_reports() {
    let addr = spawn_echo(None).await;
    let listener = Arc::new(RecordingListener::default());
    let conn = tokio::net::TcpStream::connect(addr).await.unwrap();
    let stream = TrackedStream::direct(conn, Duration::ZERO, Some(listener.clone())).unwrap();
    drop(stream);
    assert_eq!(listener.summaries().len(), 1);
}

#[tokio::test]
async fn test_retried_stream_reaches_reporter() {
    let hello = client_hello_for("www.example.com");
    let addr = spawn_echo(Some(hello.len())).await;
    let listener = Arc::new(RecordingListener::default());
    let reporter = FailureReporter::default();
    reporter.configure(&MemoryStore::new(), "mydomain.example", "zz").unwrap();
    reporter.set_dns(Some(Arc::new(EchoTransport)));

    let conn = dial_with_split_retry(dialer(), addr, SplitRetryConfig::default()).await.unwrap();
    let mut stream = TrackedStream::retrying(
        conn,
        Duration::from_millis(1),
        Some(listener.clone()),
        Some(reporter.clone()),
    );

    stream.write_all(&hello).await.unwrap();
    let mut echoed = vec![0u8; hello.len()];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, hello);

    stream.close().await.unwrap();
    let summaries = listener.summaries();
    assert_eq!(summaries.len(), 1);
    let retry = summaries[0].retry.as_ref().unwrap();
    assert!(retry.split > 0);
    assert_eq!(retry.sni, "www.example.com");
    assert_eq!(summaries[0].download_bytes, hello.len() as u64);
    assert_eq!(reporter.pending(), 1);
}

#[tokio::test]
async fn test_fake_dns_served_in_process() {
    let fake_dns: SocketAddr = "10.111.222.3:53".parse().unwrap();
    let dialer = TunnelDialer::new(fake_dns, Arc::new(EchoTransport), dialer());

    let TunnelStream::Dns(mut stream) = dialer.dial(fake_dns).await.unwrap() else {
        panic!("expected an in-process DNS stream");
    };
    let query = [0x12, 0x34, 0x01, 0x00, 0, 0, 0, 0, 0, 0, 0, 0];
    let mut framed = vec![0, query.len() as u8];
    framed.extend_from_slice(&query);
    stream.write_all(&framed).await.unwrap();

    let mut response = vec![0u8; framed.len()];
    stream.read_exact(&mut response).await.unwrap();
    assert_eq!(&response[..4], &[0, 12, 0x12, 0x34]);
    assert_eq!(response[4] & 0x80, 0x80);
}

#[tokio::test]
async fn test_other_ports_dialed_directly() {
    let addr = spawn_echo(None).await;
    let listener = Arc::new(RecordingListener::default());
    let dialer = TunnelDialer::new("10.111.222.3:53".parse().unwrap(), Arc::new(EchoTransport), dialer())
        .with_listener(listener.clone());

    let mut stream = dialer.dial(addr).await.unwrap();
    assert!(matches!(stream, TunnelStream::Tcp(_)));
    stream.write_all(b"abc").await.unwrap();
    let mut buf = [0u8; 3];
    stream.read_exact(&mut buf).await.unwrap();
    drop(stream);

    let summaries = listener.summaries();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].retry.is_none());
    assert_eq!(summaries[0].upload_bytes, 3);
}

#[tokio::test]
async fn test_enable_reporter_and_swap_dns() {
    let dir = tempfile::tempdir().unwrap();
    let dialer = TunnelDialer::new("10.111.222.3:53".parse().unwrap(), Arc::new(EchoTransport), dialer());
    assert!(!dialer.reporter().is_configured());

    dialer.enable_reporter(dir.path().join("reporter.json"), "mydomain.example", "ZZ").unwrap();
    assert!(dialer.reporter().is_configured());
    assert!(dir.path().join("reporter.json").exists());

    dialer.set_dns(Arc::new(EchoTransport));
    assert_eq!(dialer.dns().url(), "https://dns.example/dns-query");
}
