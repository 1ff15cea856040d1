use crate::base::neterror::NetError;
use std::fmt;
use thiserror::Error;

/// Outcome classification of a DoH query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Transaction completed successfully.
    Complete,
    /// The server could not be reached.
    SendFailed,
    /// The server answered with a non-200 status, or the transport is in hangover.
    HttpError,
    /// The query was malformed; nothing was sent.
    BadQuery,
    /// The server answered 200 with an unusable body.
    BadResponse,
    /// Local failure, such as the query not surviving padding.
    InternalError,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Complete => "complete",
            Status::SendFailed => "send_failed",
            Status::HttpError => "http_error",
            Status::BadQuery => "bad_query",
            Status::BadResponse => "bad_response",
            Status::InternalError => "internal_error",
        }
    }

    /// Whether a failure with this status means the server replied badly,
    /// which puts the transport into hangover.
    pub fn triggers_hangover(&self) -> bool {
        matches!(self, Status::HttpError | Status::BadResponse)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from [`add_edns_padding`](crate::doh::padding::add_edns_padding)
/// and SERVFAIL synthesis.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PaddingError {
    #[error("malformed DNS message: {0}")]
    MalformedMessage(String),
    #[error("failed to encode DNS message: {0}")]
    Encode(String),
}

/// Why a query failed.
#[derive(Debug, Clone, Error)]
pub enum QueryFailure {
    #[error("query length is {0}")]
    ShortQuery(usize),
    #[error("failed to pad query: {0}")]
    Padding(#[from] PaddingError),
    #[error("forwarder is in servfail hangover")]
    Hangover,
    #[error("failed to send query: {0}")]
    Send(#[source] NetError),
    #[error("HTTP request failed: {0}")]
    Http(u16),
    #[error("failed to read response body: {0}")]
    Body(#[source] NetError),
    #[error("response length is {0}")]
    ShortResponse(usize),
    #[error("nonzero response ID {0}")]
    NonzeroId(u16),
}

impl QueryFailure {
    pub fn status(&self) -> Status {
        match self {
            QueryFailure::ShortQuery(_) => Status::BadQuery,
            QueryFailure::Padding(_) => Status::InternalError,
            QueryFailure::Hangover | QueryFailure::Http(_) => Status::HttpError,
            QueryFailure::Send(_) => Status::SendFailed,
            QueryFailure::Body(_) | QueryFailure::ShortResponse(_) | QueryFailure::NonzeroId(_) => {
                Status::BadResponse
            }
        }
    }

    /// The HTTP status behind an `HttpError`, 0 otherwise.
    pub fn http_status(&self) -> u16 {
        match self {
            QueryFailure::Http(code) => *code,
            _ => 0,
        }
    }
}

/// A failed query, possibly with a synthesized SERVFAIL for the caller.
#[derive(Debug, Clone, Error)]
#[error("{failure}")]
pub struct QueryError {
    failure: QueryFailure,
    response: Option<Vec<u8>>,
}

impl QueryError {
    pub fn new(failure: QueryFailure) -> Self {
        Self {
            failure,
            response: None,
        }
    }

    /// Attaches the response to hand back to the DNS client.
    pub fn with_response(mut self, response: Option<Vec<u8>>) -> Self {
        self.response = response;
        self
    }

    pub fn status(&self) -> Status {
        self.failure.status()
    }

    pub fn http_status(&self) -> u16 {
        self.failure.http_status()
    }

    pub fn failure(&self) -> &QueryFailure {
        &self.failure
    }

    /// SERVFAIL response for the original query, if one could be built.
    pub fn response(&self) -> Option<&[u8]> {
        self.response.as_deref()
    }

    pub fn into_response(self) -> Option<Vec<u8>> {
        self.response
    }
}

impl From<QueryFailure> for QueryError {
    fn from(failure: QueryFailure) -> Self {
        Self::new(failure)
    }
}
