use std::io;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum NetError {
    // Connection Errors
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Connection to {host}:{port} failed: {source}")]
    ConnectionFailedTo {
        host: String,
        port: u16,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Name {domain} not resolved: {source}")]
    NameNotResolvedFor {
        domain: String,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("No IP addresses for {0}")]
    NoAddresses(String),
    #[error("SSL protocol error")]
    SslProtocolError,
    #[error("SSL handshake with {host} failed: {reason}")]
    SslHandshakeFailed { host: String, reason: String },
    #[error("Bad SSL client auth cert")]
    BadSslClientAuthCert,
    #[error("Connection timed out")]
    ConnectionTimedOut,

    // HTTP Errors
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Disallowed URL scheme: {0}")]
    DisallowedUrlScheme(String),
    #[error("Invalid response")]
    InvalidResponse,
    #[error("HTTP/2 protocol error")]
    Http2ProtocolError,

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    /// Builds a `ConnectionFailedTo` from an IO error.
    pub fn connection_failed_to(host: &str, port: u16, source: io::Error) -> Self {
        NetError::ConnectionFailedTo {
            host: host.to_string(),
            port,
            source: Arc::new(source),
        }
    }

    /// Builds a `NameNotResolvedFor` from an IO error.
    pub fn dns_failed(domain: &str, source: io::Error) -> Self {
        NetError::NameNotResolvedFor {
            domain: domain.to_string(),
            source: Arc::new(source),
        }
    }

    /// Chromium-compatible numeric code, stable across releases.
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::ConnectionRefused => -102,
            NetError::ConnectionFailed | NetError::ConnectionFailedTo { .. } => -104,
            NetError::NameNotResolved | NetError::NameNotResolvedFor { .. } => -105,
            NetError::SslProtocolError | NetError::SslHandshakeFailed { .. } => -107,
            NetError::BadSslClientAuthCert => -117,
            NetError::ConnectionTimedOut => -118,
            NetError::NoAddresses(_) => -137,

            NetError::InvalidUrl => -300,
            NetError::DisallowedUrlScheme(_) => -301,
            NetError::InvalidResponse => -320,
            NetError::Http2ProtocolError => -337,
            NetError::Unknown(code) => *code,
        }
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -102 => NetError::ConnectionRefused,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -107 => NetError::SslProtocolError,
            -117 => NetError::BadSslClientAuthCert,
            -118 => NetError::ConnectionTimedOut,

            -300 => NetError::InvalidUrl,
            -320 => NetError::InvalidResponse,
            -337 => NetError::Http2ProtocolError,
            _ => NetError::Unknown(code),
        }
    }
}
