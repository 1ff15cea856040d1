//! DNS-over-TCP front end for a [`Transport`].
//!
//! Messages in both directions are framed with a 2-byte big-endian length.
//! Queries are answered concurrently; each response frame goes out in a single
//! write so responses never interleave.

use crate::doh::error::QueryError;
use crate::doh::transport::Transport;
use crate::socket::flag::Flag;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("oversize response: {0}")]
    Oversize(usize),
    #[error("failed to write response: {0}")]
    Io(#[from] io::Error),
}

/// Frames `response` as a length-prefixed DNS-over-TCP message.
pub fn frame_response(response: &[u8]) -> Result<Vec<u8>, ForwardError> {
    let len = u16::try_from(response.len()).map_err(|_| ForwardError::Oversize(response.len()))?;
    let mut frame = Vec::with_capacity(response.len() + 2);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(response);
    Ok(frame)
}

/// Runs `query` and writes the response, real or SERVFAIL, to `writer`.
///
/// Returns the query error even when a SERVFAIL was written.
pub async fn forward_query<T, W>(
    transport: &T,
    query: &[u8],
    writer: &Mutex<W>,
) -> Result<(), ForwardError>
where
    T: Transport + ?Sized,
    W: AsyncWrite + Unpin,
{
    let (response, error) = match transport.query(query).await {
        Ok(response) => (response, None),
        Err(e) => match e.response() {
            Some(servfail) => (servfail.to_vec(), Some(e)),
            None => return Err(e.into()),
        },
    };

    let frame = frame_response(&response)?;
    writer.lock().await.write_all(&frame).await?;

    match error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

async fn forward_query_and_check<T, S>(
    transport: Arc<T>,
    query: Vec<u8>,
    writer: Arc<Mutex<WriteHalf<S>>>,
    closed: Arc<Flag>,
) where
    T: Transport + ?Sized,
    S: AsyncRead + AsyncWrite,
{
    if let Err(e) = forward_query(&*transport, &query, &writer).await {
        tracing::warn!(error = %e, "Query forwarding failed");
        if closed.close() {
            let _ = writer.lock().await.shutdown().await;
        }
    }
}

/// Serves DNS-over-TCP on `stream` until the peer stops sending or a query
/// fails. A failed query shuts the stream down.
pub async fn accept<T, S>(transport: Arc<T>, stream: S)
where
    T: Transport + ?Sized + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer));
    let closed = Arc::new(Flag::new());

    loop {
        let mut len_buf = [0u8; 2];
        let read = tokio::select! {
            _ = closed.wait() => break,
            read = reader.read_exact(&mut len_buf) => read,
        };
        match read {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!("TCP query socket clean shutdown");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Error reading from TCP query socket");
                break;
            }
        }

        let mut query = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        let read = tokio::select! {
            _ = closed.wait() => break,
            read = reader.read_exact(&mut query) => read,
        };
        if let Err(e) = read {
            tracing::warn!(error = %e, "Error reading query");
            break;
        }

        tokio::spawn(forward_query_and_check(
            transport.clone(),
            query,
            writer.clone(),
            closed.clone(),
        ));
    }
    // Queries still in flight keep the write half, and with it the stream,
    // open until they have answered.
}
