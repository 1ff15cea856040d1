//! DNS-over-HTTPS transport.
//!
//! A [`DohTransport`] turns raw DNS queries into padded, zero-ID HTTPS POSTs.
//! Connections go to whichever candidate address of the server last worked,
//! falling back to the others. A server that answers badly puts the transport
//! into a short *hangover* during which queries fail fast with SERVFAIL.

use crate::base::neterror::NetError;
use crate::dns::{GaiResolver, Resolve};
use crate::doh::error::{QueryError, QueryFailure, Status};
use crate::doh::exchange::{Exchange, ExchangeError, HttpsExchange};
use crate::doh::ipmap::IpMap;
use crate::doh::message::{query_id, set_query_id, try_servfail};
use crate::doh::padding::add_edns_padding;
use crate::socket::dial::{Dial, TcpDialer};
use crate::socket::retrier::SplitRetryConfig;
use crate::tls::config::{ClientAuth, TlsConfig};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// Tuning for a [`DohTransport`].
#[derive(Debug, Clone)]
pub struct DohConfig {
    /// How long queries are refused after a bad reply.
    pub hangover: Duration,
    pub tls_handshake_timeout: Duration,
    /// Same value as Android DNS-over-TLS.
    pub response_header_timeout: Duration,
    /// Limit on each TCP connection attempt, including a split-retry redial.
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub retry: SplitRetryConfig,
}

impl Default for DohConfig {
    fn default() -> Self {
        Self {
            hangover: Duration::from_secs(10),
            tls_handshake_timeout: Duration::from_secs(10),
            response_header_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(3),
            user_agent: "Intra".to_string(),
            retry: SplitRetryConfig::default(),
        }
    }
}

/// Opaque value returned by [`QueryListener::on_query`] and handed back with
/// the matching summary.
pub type QueryToken = Box<dyn Any + Send>;

/// What happened to one query.
#[derive(Debug, Clone)]
pub struct QuerySummary {
    pub latency: Duration,
    pub query: Vec<u8>,
    /// The response given to the caller, real or synthesized.
    pub response: Option<Vec<u8>>,
    /// IP of the server used, empty if unknown.
    pub server: String,
    pub status: Status,
    /// 200 on success, the HTTP status on `HttpError`, else 0.
    pub http_status: u16,
}

/// Receives query lifecycle events, for telemetry.
pub trait QueryListener: Send + Sync {
    fn on_query(&self, url: &str) -> QueryToken;
    fn on_response(&self, token: QueryToken, summary: &QuerySummary);
}

/// Alias for the `Future` type returned by a DNS transport.
pub type Querying = Pin<Box<dyn Future<Output = Result<Vec<u8>, QueryError>> + Send>>;

/// A DNS query transport.
pub trait Transport: Send + Sync {
    /// Given a DNS query (including ID), returns a response with the same ID.
    ///
    /// A failure may carry a SERVFAIL response in [`QueryError::response`].
    fn query(&self, query: &[u8]) -> Querying;

    /// The server URL this transport was built for.
    fn url(&self) -> &str;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn query(&self, query: &[u8]) -> Querying {
        (**self).query(query)
    }

    fn url(&self) -> &str {
        (**self).url()
    }
}

/// Builder for [`DohTransport`].
pub struct DohTransportBuilder {
    url: String,
    addrs: Vec<String>,
    dialer: Option<Arc<dyn Dial>>,
    resolver: Option<Arc<dyn Resolve>>,
    client_auth: Option<ClientAuth>,
    listener: Option<Arc<dyn QueryListener>>,
    exchange: Option<Arc<dyn Exchange>>,
    tls: TlsConfig,
    config: DohConfig,
}

impl DohTransportBuilder {
    /// Fallback addresses (IPs or hostnames) for the server's hostname.
    pub fn fallback_addrs<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addrs.extend(addrs.into_iter().map(Into::into));
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dial>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn client_auth(mut self, auth: ClientAuth) -> Self {
        self.client_auth = Some(auth);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn QueryListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Replaces the HTTPS client, e.g. with an in-process fake.
    pub fn exchange(mut self, exchange: Arc<dyn Exchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn config(mut self, config: DohConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolves the server hostname and builds the transport.
    ///
    /// Fails if the URL is not `https` or no address is known for its host.
    pub async fn build(self) -> Result<DohTransport, NetError> {
        let parsed = Url::parse(&self.url).map_err(|_| NetError::InvalidUrl)?;
        if parsed.scheme() != "https" {
            return Err(NetError::DisallowedUrlScheme(parsed.scheme().to_string()));
        }
        let host = parsed.host_str().ok_or(NetError::InvalidUrl)?;
        let hostname = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
            .to_string();

        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(GaiResolver::new()) as Arc<dyn Resolve>);
        let ips = Arc::new(IpMap::new(resolver));
        let set = ips.get(&hostname).await;
        for addr in &self.addrs {
            set.add(addr).await;
        }
        if set.is_empty() {
            return Err(NetError::NoAddresses(hostname));
        }

        let exchange = match self.exchange {
            Some(exchange) => exchange,
            None => {
                let uri: http::Uri = self.url.parse().map_err(|_| NetError::InvalidUrl)?;
                let dialer = self
                    .dialer
                    .unwrap_or_else(|| Arc::new(TcpDialer::new()) as Arc<dyn Dial>);
                Arc::new(HttpsExchange::new(
                    uri,
                    ips.clone(),
                    dialer,
                    &self.tls,
                    self.client_auth.as_ref(),
                    self.config.clone(),
                )?)
            }
        };

        tracing::debug!(url = %self.url, candidates = set.len(), "DoH transport ready");
        Ok(DohTransport {
            inner: Arc::new(TransportInner {
                url: self.url,
                hostname,
                ips,
                exchange,
                listener: self.listener,
                hangover_expiration: RwLock::new(None),
                config: self.config,
            }),
        })
    }
}

struct TransportInner {
    url: String,
    hostname: String,
    ips: Arc<IpMap>,
    exchange: Arc<dyn Exchange>,
    listener: Option<Arc<dyn QueryListener>>,
    hangover_expiration: RwLock<Option<Instant>>,
    config: DohConfig,
}

/// POST-only DNS-over-HTTPS transport. Cheap to clone.
#[derive(Clone)]
pub struct DohTransport {
    inner: Arc<TransportInner>,
}

impl DohTransport {
    pub fn builder(url: impl Into<String>) -> DohTransportBuilder {
        DohTransportBuilder {
            url: url.into(),
            addrs: Vec::new(),
            dialer: None,
            resolver: None,
            client_auth: None,
            listener: None,
            exchange: None,
            tls: TlsConfig::default(),
            config: DohConfig::default(),
        }
    }

    /// Candidate addresses of the server, keyed by hostname.
    pub fn ips(&self) -> &Arc<IpMap> {
        &self.inner.ips
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn in_hangover(&self) -> bool {
        self.inner.in_hangover()
    }
}

impl TransportInner {
    fn in_hangover(&self) -> bool {
        let expiration = *self
            .hangover_expiration
            .read()
            .unwrap_or_else(|e| e.into_inner());
        expiration.is_some_and(|expiration| Instant::now() < expiration)
    }

    fn start_hangover(&self) {
        let expiration = Instant::now() + self.config.hangover;
        *self
            .hangover_expiration
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(expiration);
    }

    async fn query(&self, query: Vec<u8>) -> Result<Vec<u8>, QueryError> {
        let token = self.listener.as_ref().map(|l| l.on_query(&self.url));

        let before = Instant::now();
        let (result, server) = self.do_query(&query).await;
        let latency = before.elapsed();

        if let (Some(listener), Some(token)) = (&self.listener, token) {
            let (status, http_status, response) = match &result {
                Ok(response) => (Status::Complete, 200, Some(response.clone())),
                Err(e) => (e.status(), e.http_status(), e.response().map(<[u8]>::to_vec)),
            };
            let summary = QuerySummary {
                latency,
                query,
                response,
                server: server.map(|s| s.ip().to_string()).unwrap_or_default(),
                status,
                http_status,
            };
            listener.on_response(token, &summary);
        }
        result
    }

    /// Runs one query. Independent of the outcome, also returns the server
    /// address on a best-effort basis.
    async fn do_query(&self, query: &[u8]) -> (Result<Vec<u8>, QueryError>, Option<SocketAddr>) {
        if query.len() < 2 {
            return (Err(QueryFailure::ShortQuery(query.len()).into()), None);
        }

        if self.in_hangover() {
            let err = QueryError::new(QueryFailure::Hangover).with_response(try_servfail(query));
            return (Err(err), None);
        }

        let mut padded = match add_edns_padding(query) {
            Ok(padded) => padded,
            Err(e) => return (Err(QueryFailure::Padding(e).into()), None),
        };

        // DoH requests carry ID 0 so they are cache friendly and unlinkable.
        let id = query_id(&padded).unwrap_or(0);
        set_query_id(&mut padded, 0);

        tracing::debug!(id, "Sending query");
        let (outcome, server) = self.send(id, padded).await;

        let failure = match outcome {
            Ok(mut response) => match query_id(&response) {
                Some(0) => {
                    set_query_id(&mut response, id);
                    if let Some(server) = server {
                        self.ips.get(&self.hostname).await.confirm(server.ip());
                    }
                    return (Ok(response), server);
                }
                Some(nonzero) => QueryFailure::NonzeroId(nonzero),
                None => QueryFailure::ShortResponse(response.len()),
            },
            Err(failure) => failure,
        };

        if failure.status().triggers_hangover() {
            tracing::warn!(id, error = %failure, hangover = ?self.config.hangover, "Entering servfail hangover");
            self.start_hangover();
        }
        let err = QueryError::new(failure).with_response(try_servfail(query));
        (Err(err), server)
    }

    /// Sends the request. On failure the server is disconfirmed and its
    /// connection dropped, since sockets often go bad after a network change.
    async fn send(
        &self,
        id: u16,
        body: Vec<u8>,
    ) -> (Result<Vec<u8>, QueryFailure>, Option<SocketAddr>) {
        let (result, server) = match self.exchange.exchange(body).await {
            Ok(response) if response.status == 200 => {
                tracing::debug!(id, "Got response");
                (Ok(response.body), response.server)
            }
            Ok(response) => {
                tracing::debug!(id, status = response.status, "HTTP error");
                (Err(QueryFailure::Http(response.status)), response.server)
            }
            Err(e) => {
                let server = e.server();
                let failure = match e {
                    ExchangeError::Send { source, .. } => QueryFailure::Send(source),
                    ExchangeError::Body { source, .. } => QueryFailure::Body(source),
                };
                (Err(failure), server)
            }
        };

        if let Err(failure) = &result {
            tracing::info!(id, error = %failure, "Query failed");
            if let Some(server) = server {
                tracing::debug!(id, ip = %server.ip(), "Disconfirming");
                self.ips.get(&self.hostname).await.disconfirm(server.ip());
            }
            self.exchange.discard(server);
        }
        (result, server)
    }
}

impl Transport for DohTransport {
    fn query(&self, query: &[u8]) -> Querying {
        let inner = self.inner.clone();
        let query = query.to_vec();
        Box::pin(async move { inner.query(query).await })
    }

    fn url(&self) -> &str {
        &self.inner.url
    }
}

impl fmt::Debug for DohTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DohTransport")
            .field("url", &self.inner.url)
            .field("ips", &self.inner.ips)
            .finish_non_exhaustive()
    }
}
