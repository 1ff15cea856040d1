//! Split-retry stream tests over loopback sockets.

use splitnet::socket::{dial_with_split_retry, Dial, SplitRetryConfig, TcpDialer, MAX_HELLO_LEN};
use splitnet::tls::sni::client_hello_for;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

const REPLY: &[u8] = b"server hello";

fn dialer() -> Arc<dyn Dial> {
    Arc::new(TcpDialer::new().with_connect_timeout(Duration::from_secs(5)))
}

fn first_flight() -> (Vec<u8>, Vec<u8>) {
    (client_hello_for("www.example.com"), vec![0x17; 200])
}

async fn read_reply(stream: &splitnet::socket::SplitRetryStream) -> Vec<u8> {
    let mut reply = vec![0u8; REPLY.len()];
    let mut filled = 0;
    while filled < reply.len() {
        let n = stream.read(&mut reply[filled..]).await.unwrap();
        assert!(n > 0, "unexpected EOF");
        filled += n;
    }
    reply
}

/// Accepts connections and reads `expected` bytes from each. The first
/// `failures` connections are then closed, or left silent when `stall` is
/// set; later ones are answered with [`REPLY`].
async fn spawn_server(
    expected: usize,
    failures: usize,
    stall: bool,
) -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut held = Vec::new();
        for i in 0.. {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            let mut received = vec![0u8; expected];
            if conn.read_exact(&mut received).await.is_err() {
                continue;
            }
            let _ = tx.send(received);
            if i < failures {
                if stall {
                    held.push(conn);
                }
                continue;
            }
            conn.write_all(REPLY).await.unwrap();
            held.push(conn);
        }
    });
    (addr, rx)
}

#[tokio::test]
async fn test_no_retry_when_server_answers() {
    let (hello, extra) = first_flight();
    let (addr, mut rx) = spawn_server(hello.len() + extra.len(), 0, false).await;

    let stream = dial_with_split_retry(dialer(), addr, SplitRetryConfig::default())
        .await
        .unwrap();
    stream.write_all(&hello).await.unwrap();
    stream.write_all(&extra).await.unwrap();
    assert!(!stream.is_finalized());

    assert_eq!(read_reply(&stream).await, REPLY);
    assert!(stream.is_finalized());

    let stats = stream.stats();
    assert_eq!(stats.split, 0);
    assert!(!stats.retried());
    assert_eq!(stats.sni, "www.example.com");
    assert_eq!(stats.bytes, hello.len() + extra.len());
    assert_eq!(stats.chunks, 2);

    let received = rx.recv().await.unwrap();
    assert_eq!(&received[..hello.len()], &hello[..]);
    assert_eq!(stream.remote_addr(), addr);
}

#[tokio::test]
async fn test_retry_after_close() {
    let (hello, extra) = first_flight();
    let total = hello.len() + extra.len();
    let (addr, mut rx) = spawn_server(total, 1, false).await;

    let stream = dial_with_split_retry(dialer(), addr, SplitRetryConfig::default())
        .await
        .unwrap();
    let first_local = stream.local_addr().await.unwrap();
    stream.write_all(&hello).await.unwrap();
    stream.write_all(&extra).await.unwrap();

    assert_eq!(read_reply(&stream).await, REPLY);

    let stats = stream.stats();
    assert!(stats.retried());
    assert!((32..=64).contains(&stats.split), "split = {}", stats.split);
    assert!(!stats.timeout);
    assert_eq!(stats.sni, "www.example.com");
    assert_eq!(stats.bytes, total);

    // Both physical connections saw the same bytes.
    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(&second[..hello.len()], &hello[..]);
    assert_ne!(stream.local_addr().await.unwrap(), first_local);
}

#[tokio::test]
async fn test_retry_after_timeout() {
    let (hello, extra) = first_flight();
    let total = hello.len() + extra.len();
    let (addr, mut rx) = spawn_server(total, 1, true).await;

    let config = SplitRetryConfig::default().with_base_timeout(Duration::from_millis(200));
    let stream = dial_with_split_retry(dialer(), addr, config).await.unwrap();
    stream.write_all(&hello).await.unwrap();
    stream.write_all(&extra).await.unwrap();

    assert_eq!(read_reply(&stream).await, REPLY);

    let stats = stream.stats();
    assert!(stats.timeout);
    assert!((32..=64).contains(&stats.split));
    assert_eq!(rx.recv().await.unwrap(), rx.recv().await.unwrap());
}

#[tokio::test]
async fn test_no_retry_after_close_read() {
    let (hello, extra) = first_flight();
    let (addr, _rx) = spawn_server(hello.len() + extra.len(), 1, false).await;

    let stream = dial_with_split_retry(dialer(), addr, SplitRetryConfig::default())
        .await
        .unwrap();
    stream.write_all(&hello).await.unwrap();
    stream.write_all(&extra).await.unwrap();
    stream.close_read().await.unwrap();
    assert!(stream.read_closed());

    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    assert_eq!(stream.stats().split, 0);
    assert!(stream.is_finalized());
}

#[tokio::test]
async fn test_async_io_adapters() {
    let (hello, extra) = first_flight();
    let (addr, _rx) = spawn_server(hello.len() + extra.len(), 1, false).await;

    let mut stream = dial_with_split_retry(dialer(), addr, SplitRetryConfig::default())
        .await
        .unwrap();
    AsyncWriteExt::write_all(&mut stream, &hello).await.unwrap();
    AsyncWriteExt::write_all(&mut stream, &extra).await.unwrap();
    stream.flush().await.unwrap();

    let mut reply = vec![0u8; REPLY.len()];
    AsyncReadExt::read_exact(&mut stream, &mut reply).await.unwrap();
    assert_eq!(reply, REPLY);
    assert!(stream.stats().retried());

    stream.shutdown().await.unwrap();
    assert!(stream.write_closed());
}

#[tokio::test]
async fn test_read_deadline() {
    let (hello, _) = first_flight();
    let (addr, _rx) = spawn_server(hello.len(), 0, false).await;

    let stream = dial_with_split_retry(dialer(), addr, SplitRetryConfig::default())
        .await
        .unwrap();
    stream.write_all(&hello).await.unwrap();
    assert_eq!(read_reply(&stream).await, REPLY);

    stream.set_read_deadline(Some(tokio::time::Instant::now()));
    let mut buf = [0u8; 4];
    let err = stream.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

    stream.set_deadline(None);
    stream.close().await.unwrap();
}

#[tokio::test]
async fn test_write_failure_waits_for_retry() {
    let (hello, _) = first_flight();
    let payload = vec![0x17u8; 300];
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    let hello_len = hello.len();
    tokio::spawn(async move {
        // First connection: take the hello, then reset.
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut received = vec![0u8; hello_len];
        conn.read_exact(&mut received).await.unwrap();
        socket2::SockRef::from(&conn).set_linger(Some(Duration::ZERO)).unwrap();
        drop(conn);

        // Second connection: answer the replayed hello, then collect the rest.
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut received = vec![0u8; hello_len];
        conn.read_exact(&mut received).await.unwrap();
        conn.write_all(REPLY).await.unwrap();
        conn.read_to_end(&mut received).await.unwrap();
        let _ = tx.send(received);
    });

    let stream = dial_with_split_retry(dialer(), addr, SplitRetryConfig::default())
        .await
        .unwrap();
    stream.write_all(&hello).await.unwrap();
    // Let the reset arrive before the next write.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let writer = {
        let stream = stream.clone();
        let payload = payload.clone();
        tokio::spawn(async move { stream.write_all(&payload).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stream.is_finalized());

    assert_eq!(read_reply(&stream).await, REPLY);
    writer.await.unwrap().unwrap();
    assert!(stream.stats().retried());
    stream.close_write().await.unwrap();

    // The second connection saw the hello and the payload exactly once.
    let second = rx.await.unwrap();
    assert_eq!(second, [hello, payload].concat());
}

#[tokio::test]
async fn test_half_close_carried_to_new_connection() {
    let (hello, _) = first_flight();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    let hello_len = hello.len();
    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut received = vec![0u8; hello_len];
        conn.read_exact(&mut received).await.unwrap();
        drop(conn);

        let (mut conn, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        conn.read_to_end(&mut received).await.unwrap();
        conn.write_all(REPLY).await.unwrap();
        let _ = tx.send(received);
    });

    let stream = dial_with_split_retry(dialer(), addr, SplitRetryConfig::default())
        .await
        .unwrap();
    stream.write_all(&hello).await.unwrap();
    stream.close_write().await.unwrap();

    assert_eq!(read_reply(&stream).await, REPLY);
    assert!(stream.stats().retried());
    // read_to_end returning means the replacement saw hello, then EOF.
    assert_eq!(rx.await.unwrap(), hello);
}

#[tokio::test]
async fn test_failed_retry_dial_reaches_reader() {
    let (hello, _) = first_flight();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hello_len = hello.len();
    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        drop(listener);
        let mut received = vec![0u8; hello_len];
        let _ = conn.read_exact(&mut received).await;
    });

    let stream = dial_with_split_retry(dialer(), addr, SplitRetryConfig::default())
        .await
        .unwrap();
    stream.write_all(&hello).await.unwrap();

    let mut buf = [0u8; 16];
    assert!(stream.read(&mut buf).await.is_err());
    assert!(stream.is_finalized());
    let stats = stream.stats();
    assert_eq!(stats.split, 0);
    assert_eq!(stats.sni, "www.example.com");
}

#[tokio::test]
async fn test_oversized_first_flight_is_not_buffered() {
    let (hello, _) = first_flight();
    let bulk = vec![0x17u8; MAX_HELLO_LEN];
    let (addr, mut rx) = spawn_server(hello.len() + bulk.len(), 0, false).await;

    let stream = dial_with_split_retry(dialer(), addr, SplitRetryConfig::default())
        .await
        .unwrap();
    stream.write_all(&hello).await.unwrap();
    stream.write_all(&bulk).await.unwrap();
    assert!(stream.is_finalized());

    assert_eq!(read_reply(&stream).await, REPLY);
    let stats = stream.stats();
    assert_eq!(stats.bytes, hello.len());
    assert_eq!(stats.chunks, 1);
    assert!(!stats.retried());
    assert_eq!(rx.recv().await.unwrap().len(), hello.len() + bulk.len());
}
