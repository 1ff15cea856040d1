//! The HTTP leg of a DoH query.
//!
//! [`Exchange`] posts one padded, zero-ID query and hands back the raw HTTP
//! outcome; the transport classifies it. [`HttpsExchange`] is the production
//! implementation: BoringSSL over split-retry TCP connections, reusing one
//! HTTP/2 connection (or idle HTTP/1.1 connection) across queries.

use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::doh::ipmap::IpMap;
use crate::doh::transport::DohConfig;
use crate::socket::dial::Dial;
use crate::socket::retrier::{dial_with_split_retry, SplitRetryStream};
use crate::tls::config::{ClientAuth, TlsConfig};
use boring::ssl::SslConnector;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub const DNS_MESSAGE_MIME: &str = "application/dns-message";

/// Raw result of a DoH POST that got an HTTP response.
#[derive(Debug, Clone)]
pub struct ExchangeResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Server the request went to.
    pub server: Option<SocketAddr>,
}

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// No HTTP response was received.
    #[error("{source}")]
    Send {
        source: NetError,
        server: Option<SocketAddr>,
    },
    /// Response headers arrived but the body could not be read.
    #[error("{source}")]
    Body {
        source: NetError,
        server: Option<SocketAddr>,
    },
}

impl ExchangeError {
    pub fn send(source: NetError, server: Option<SocketAddr>) -> Self {
        ExchangeError::Send { source, server }
    }

    pub fn server(&self) -> Option<SocketAddr> {
        match self {
            ExchangeError::Send { server, .. } | ExchangeError::Body { server, .. } => *server,
        }
    }
}

pub type Exchanging =
    Pin<Box<dyn Future<Output = Result<ExchangeResponse, ExchangeError>> + Send>>;

/// Sends a DNS query body to the DoH server.
pub trait Exchange: Send + Sync {
    fn exchange(&self, body: Vec<u8>) -> Exchanging;

    /// Drops any reusable connection to `server`; called after a failed query.
    fn discard(&self, _server: Option<SocketAddr>) {}
}

impl<E: Exchange + ?Sized> Exchange for Arc<E> {
    fn exchange(&self, body: Vec<u8>) -> Exchanging {
        (**self).exchange(body)
    }

    fn discard(&self, server: Option<SocketAddr>) {
        (**self).discard(server)
    }
}

enum Sender {
    Http1(http1::SendRequest<Full<Bytes>>),
    Http2(http2::SendRequest<Full<Bytes>>),
}

impl Sender {
    fn is_http2(&self) -> bool {
        matches!(self, Sender::Http2(_))
    }

    fn is_closed(&self) -> bool {
        match self {
            Sender::Http1(s) => s.is_closed(),
            Sender::Http2(s) => s.is_closed(),
        }
    }

    async fn send(&mut self, req: Request<Full<Bytes>>) -> hyper::Result<Response<Incoming>> {
        match self {
            Sender::Http1(s) => {
                s.ready().await?;
                s.send_request(req).await
            }
            Sender::Http2(s) => {
                s.ready().await?;
                s.send_request(req).await
            }
        }
    }
}

struct Pooled {
    sender: Sender,
    server: SocketAddr,
}

struct HttpsInner {
    uri: Uri,
    hostname: String,
    port: u16,
    ips: Arc<IpMap>,
    dialer: Arc<dyn Dial>,
    connector: SslConnector,
    config: DohConfig,
    idle: Mutex<Option<Pooled>>,
}

/// DoH over HTTPS with IP fallback and split-retry connections.
#[derive(Clone)]
pub struct HttpsExchange {
    inner: Arc<HttpsInner>,
}

impl HttpsExchange {
    pub fn new(
        uri: Uri,
        ips: Arc<IpMap>,
        dialer: Arc<dyn Dial>,
        tls: &TlsConfig,
        client_auth: Option<&ClientAuth>,
        config: DohConfig,
    ) -> Result<Self, NetError> {
        let hostname = uri.host().ok_or(NetError::InvalidUrl)?;
        let hostname = hostname
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(hostname)
            .to_string();
        let port = uri.port_u16().unwrap_or(443);
        let connector = tls.build_connector(client_auth)?;
        Ok(Self {
            inner: Arc::new(HttpsInner {
                uri,
                hostname,
                port,
                ips,
                dialer,
                connector,
                config,
                idle: Mutex::new(None),
            }),
        })
    }
}

impl HttpsInner {
    fn idle(&self) -> std::sync::MutexGuard<'_, Option<Pooled>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Dials the confirmed IP first, then every other candidate in random order.
    async fn dial(&self) -> Result<SplitRetryStream, NetError> {
        let ips = self.ips.get(&self.hostname).await;
        let confirmed = ips.confirmed();
        let mut last_error = None;

        if let Some(ip) = confirmed {
            tracing::debug!(%ip, host = %self.hostname, "Trying confirmed IP");
            match self.dial_ip(SocketAddr::new(ip, self.port)).await {
                Ok(stream) => {
                    tracing::info!(%ip, "Confirmed IP worked");
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!(%ip, error = %e, "Confirmed IP failed");
                    ips.disconfirm(ip);
                    last_error = Some(e);
                }
            }
        }

        tracing::debug!(host = %self.hostname, "Trying all IPs");
        for ip in ips.all() {
            if Some(ip) == confirmed {
                continue;
            }
            match self.dial_ip(SocketAddr::new(ip, self.port)).await {
                Ok(stream) => {
                    tracing::info!(%ip, "Found working IP");
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!(%ip, error = %e, "IP failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => e,
            None => NetError::NoAddresses(self.hostname.clone()),
        })
    }

    async fn dial_ip(&self, addr: SocketAddr) -> Result<SplitRetryStream, NetError> {
        let dialing = dial_with_split_retry(self.dialer.clone(), addr, self.config.retry.clone());
        match tokio::time::timeout(self.config.connect_timeout, dialing).await {
            Ok(result) => result.addr_context(addr),
            Err(_) => Err(NetError::ConnectionTimedOut),
        }
    }

    async fn connect(&self) -> Result<Pooled, NetError> {
        let stream = self.dial().await?;
        let server = stream.remote_addr();

        let mut ssl = self
            .connector
            .configure()
            .map_err(|_| NetError::SslProtocolError)?;
        if !TlsConfig::should_set_sni(&self.hostname) {
            ssl.set_use_server_name_indication(false);
        }
        let handshake = tokio_boring::connect(ssl, &self.hostname, stream);
        let tls = tokio::time::timeout(self.config.tls_handshake_timeout, handshake)
            .await
            .map_err(|_| NetError::ConnectionTimedOut)?
            .map_err(|e| NetError::SslHandshakeFailed {
                host: self.hostname.clone(),
                reason: e.to_string(),
            })?;

        let h2 = tls.ssl().selected_alpn_protocol() == Some(b"h2".as_slice());
        tracing::debug!(%server, h2, "TLS established");
        let io = TokioIo::new(tls);

        let sender = if h2 {
            let mut builder = http2::Builder::new(TokioExecutor::new());
            builder.timer(TokioTimer::new());
            let (sender, conn) = builder
                .handshake(io)
                .await
                .map_err(|_| NetError::Http2ProtocolError)?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::debug!(error = %e, "DoH connection closed");
                }
            });
            Sender::Http2(sender)
        } else {
            let (sender, conn) = http1::handshake(io)
                .await
                .map_err(|_| NetError::ConnectionFailed)?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::debug!(error = %e, "DoH connection closed");
                }
            });
            Sender::Http1(sender)
        };
        Ok(Pooled { sender, server })
    }

    /// Takes a usable connection: a clone of the shared HTTP/2 sender, or the
    /// idle HTTP/1.1 connection, or a fresh one.
    async fn checkout(&self) -> Result<Pooled, NetError> {
        {
            let mut idle = self.idle();
            if let Some(pooled) = idle.take() {
                if !pooled.sender.is_closed() {
                    if let Sender::Http2(sender) = &pooled.sender {
                        let shared = Pooled {
                            sender: Sender::Http2(sender.clone()),
                            server: pooled.server,
                        };
                        *idle = Some(pooled);
                        return Ok(shared);
                    }
                    return Ok(pooled);
                }
            }
        }

        let pooled = self.connect().await?;
        if let Sender::Http2(sender) = &pooled.sender {
            *self.idle() = Some(Pooled {
                sender: Sender::Http2(sender.clone()),
                server: pooled.server,
            });
        }
        Ok(pooled)
    }

    fn checkin(&self, pooled: Pooled) {
        if pooled.sender.is_http2() || pooled.sender.is_closed() {
            return;
        }
        let mut idle = self.idle();
        if idle.is_none() {
            *idle = Some(pooled);
        }
    }

    fn request(&self, body: Vec<u8>, h2: bool) -> Result<Request<Full<Bytes>>, NetError> {
        let mut builder = Request::builder().method(Method::POST);
        if h2 {
            builder = builder.uri(self.uri.clone());
        } else {
            let path = self
                .uri
                .path_and_query()
                .map(|p| p.as_str())
                .unwrap_or("/");
            let authority = self.uri.authority().ok_or(NetError::InvalidUrl)?;
            builder = builder.uri(path).header(HOST, authority.as_str());
        }
        builder
            .header(CONTENT_TYPE, DNS_MESSAGE_MIME)
            .header(ACCEPT, DNS_MESSAGE_MIME)
            .header(USER_AGENT, self.config.user_agent.as_str())
            .body(Full::new(Bytes::from(body)))
            .map_err(|_| NetError::InvalidUrl)
    }

    async fn exchange(&self, body: Vec<u8>) -> Result<ExchangeResponse, ExchangeError> {
        let mut pooled = self.checkout().await.map_err(|e| ExchangeError::send(e, None))?;
        let server = Some(pooled.server);

        let req = self
            .request(body, pooled.sender.is_http2())
            .map_err(|e| ExchangeError::send(e, server))?;
        let response = tokio::time::timeout(self.config.response_header_timeout, pooled.sender.send(req))
            .await
            .map_err(|_| ExchangeError::send(NetError::ConnectionTimedOut, server))?
            .map_err(|e| {
                tracing::debug!(error = %e, "DoH request failed");
                ExchangeError::send(NetError::ConnectionFailed, server)
            })?;

        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| {
                tracing::debug!(error = %e, "DoH body read failed");
                ExchangeError::Body {
                    source: NetError::InvalidResponse,
                    server,
                }
            })?
            .to_bytes()
            .to_vec();

        self.checkin(pooled);
        Ok(ExchangeResponse {
            status,
            body,
            server,
        })
    }
}

impl Exchange for HttpsExchange {
    fn exchange(&self, body: Vec<u8>) -> Exchanging {
        let inner = self.inner.clone();
        Box::pin(async move { inner.exchange(body).await })
    }

    fn discard(&self, server: Option<SocketAddr>) {
        let mut idle = self.inner.idle();
        let stale = match (&*idle, server) {
            (Some(pooled), Some(server)) => pooled.server == server,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if stale {
            tracing::info!(?server, "Closing failing DoH socket");
            *idle = None;
        }
    }
}

impl fmt::Debug for HttpsExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpsExchange")
            .field("uri", &self.inner.uri)
            .field("port", &self.inner.port)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticResolver;
    use crate::socket::dial::{Dialing, TcpDialer};
    use std::io;
    use std::net::IpAddr;
    use tokio::net::{TcpListener, TcpStream};

    fn exchange_with(url: &str, ips: Arc<IpMap>, dialer: Arc<dyn Dial>) -> HttpsExchange {
        HttpsExchange::new(
            url.parse().unwrap(),
            ips,
            dialer,
            &TlsConfig::default(),
            None,
            DohConfig::default(),
        )
        .unwrap()
    }

    fn exchange_for(url: &str) -> HttpsExchange {
        let resolver = StaticResolver::new().with_host("dns.example", vec!["127.0.0.1".parse().unwrap()]);
        exchange_with(
            url,
            Arc::new(IpMap::new(Arc::new(resolver))),
            Arc::new(TcpDialer::new()),
        )
    }

    /// Refuses the listed IPs and connects every other dial to `target`,
    /// recording the order of attempts.
    struct ScriptedDialer {
        target: SocketAddr,
        refused: Vec<IpAddr>,
        attempts: Mutex<Vec<IpAddr>>,
    }

    impl ScriptedDialer {
        fn attempts(&self) -> Vec<IpAddr> {
            self.attempts.lock().unwrap().clone()
        }
    }

    impl Dial for ScriptedDialer {
        fn dial(&self, addr: SocketAddr) -> Dialing {
            self.attempts.lock().unwrap().push(addr.ip());
            let refused = self.refused.contains(&addr.ip());
            let target = self.target;
            Box::pin(async move {
                if refused {
                    return Err(io::ErrorKind::ConnectionRefused.into());
                }
                TcpStream::connect(target).await
            })
        }
    }

    fn candidates() -> Vec<IpAddr> {
        ["192.0.2.1", "192.0.2.2", "192.0.2.3"]
            .iter()
            .map(|ip| ip.parse().unwrap())
            .collect()
    }

    #[test]
    fn test_host_and_port() {
        let ex = exchange_for("https://dns.example/dns-query");
        assert_eq!(ex.inner.hostname, "dns.example");
        assert_eq!(ex.inner.port, 443);

        let ex = exchange_for("https://[2001:db8::1]:8443/dns-query");
        assert_eq!(ex.inner.hostname, "2001:db8::1");
        assert_eq!(ex.inner.port, 8443);
    }

    #[test]
    fn test_http1_request_shape() {
        let ex = exchange_for("https://dns.example/dns-query?x=1");
        let req = ex.inner.request(vec![0, 0, 1], false).unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri(), "/dns-query?x=1");
        assert_eq!(req.headers()[HOST], "dns.example");
        assert_eq!(req.headers()[CONTENT_TYPE], DNS_MESSAGE_MIME);
        assert_eq!(req.headers()[ACCEPT], DNS_MESSAGE_MIME);
        assert_eq!(req.headers()[USER_AGENT], "Intra");
    }

    #[test]
    fn test_http2_request_uses_absolute_uri() {
        let ex = exchange_for("https://dns.example/dns-query");
        let req = ex.inner.request(vec![0, 0], true).unwrap();
        assert_eq!(req.uri(), "https://dns.example/dns-query");
        assert!(req.headers().get(HOST).is_none());
    }

    #[tokio::test]
    async fn test_no_candidates() {
        let ex = exchange_for("https://unknown.example/dns-query");
        let err = ex.exchange(vec![0, 0]).await.unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Send {
                source: NetError::NoAddresses(_),
                server: None
            }
        ));
    }

    #[tokio::test]
    async fn test_dial_tries_confirmed_ip_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ips = candidates();
        let dialer = Arc::new(ScriptedDialer {
            target: listener.local_addr().unwrap(),
            refused: vec![ips[0]],
            attempts: Mutex::new(Vec::new()),
        });
        let map = Arc::new(IpMap::new(Arc::new(
            StaticResolver::new().with_host("dns.example", ips.clone()),
        )));
        let set = map.get("dns.example").await;
        set.confirm(ips[0]);

        let ex = exchange_with("https://dns.example/dns-query", map, dialer.clone());
        let stream = ex.inner.dial().await.unwrap();

        let attempts = dialer.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0], ips[0]);
        assert_ne!(attempts[1], ips[0]);
        assert_eq!(stream.remote_addr(), SocketAddr::new(attempts[1], 443));
        // The confirmed IP failed, so it is dropped and not retried.
        assert_eq!(set.confirmed(), None);
    }

    #[tokio::test]
    async fn test_dial_all_candidates_failing() {
        let ips = candidates();
        let dialer = Arc::new(ScriptedDialer {
            target: "127.0.0.1:9".parse().unwrap(),
            refused: ips.clone(),
            attempts: Mutex::new(Vec::new()),
        });
        let map = Arc::new(IpMap::new(Arc::new(
            StaticResolver::new().with_host("dns.example", ips.clone()),
        )));
        map.get("dns.example").await.confirm(ips[1]);

        let ex = exchange_with("https://dns.example/dns-query", map, dialer.clone());
        let err = ex.inner.dial().await.unwrap_err();
        assert!(matches!(err, NetError::ConnectionFailedTo { port: 443, .. }));

        let mut attempts = dialer.attempts();
        assert_eq!(attempts[0], ips[1]);
        attempts.sort();
        assert_eq!(attempts, ips, "each candidate is dialed exactly once");
    }
}
