use http::{HeaderMap, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Boxed error type accepted from user code and tower layers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared error source. `HttpError` is `Clone`, so causes are reference counted.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Classification of URL validation failures.
///
/// Provides programmatic matching for different failure modes without
/// relying on unstable error message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// URL could not be parsed (malformed syntax)
    ParseError,
    /// URL is missing required host/authority component
    MissingAuthority,
    /// URL scheme is not `http` or `https`
    UnsupportedScheme,
}

/// Error carrying the head of a response that a response-side middleware
/// rejected after the transport round trip succeeded.
///
/// The body is not retained; the middleware that produced this error owns
/// (and drops) it.
#[derive(Error, Debug, Clone)]
#[error("Response rejected (HTTP {status}): {source}")]
pub struct ResponseError {
    /// Status of the rejected response
    pub status: StatusCode,
    /// Headers of the rejected response
    pub headers: HeaderMap,
    /// Why the response was rejected
    #[source]
    pub source: Box<HttpError>,
}

/// HTTP pipeline error types
///
/// Errors are cheap to clone: a [`Response`](crate::Response) hands its
/// captured error out from every accessor and from each `close()` call.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum HttpError {
    /// Request could not be constructed before entering the pipeline.
    ///
    /// Use the `kind` field for programmatic matching. The `reason` field is
    /// diagnostic only; its format may change between releases.
    #[error("Invalid request URL '{url}': {reason}")]
    InvalidRequest {
        /// The URL that failed to parse
        url: String,
        /// Structured failure classification
        kind: InvalidUriKind,
        /// Diagnostic message (unstable format, for logging only)
        reason: String,
    },

    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[source] Arc<http::Error>),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[source] Arc<http::header::InvalidHeaderName>),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[source] Arc<http::header::InvalidHeaderValue>),

    /// JSON encoding or decoding failed
    #[error("JSON processing failed: {0}")]
    Json(#[source] Arc<serde_json::Error>),

    /// XML encoding or decoding failed
    #[error("XML processing failed: {0}")]
    Xml(#[source] SharedError),

    /// Form URL encoding error
    #[error("Form encoding failed: {0}")]
    FormEncode(#[source] Arc<serde_urlencoded::ser::Error>),

    /// Local I/O failure (body reader, file output)
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// Body factory failed to produce a fresh stream
    #[error("Body factory failed: {0}")]
    BodyFactory(#[source] SharedError),

    /// Multipart boundary rejected by RFC 2046 rules
    #[error("Invalid multipart boundary '{0}'")]
    InvalidBoundary(String),

    /// Any other failure raised by a middleware
    #[error("Pipeline error: {0}")]
    Pipeline(#[source] SharedError),

    /// Transport error (network, connection, protocol)
    #[error("Transport error: {0}")]
    Transport(#[source] SharedError),

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(#[source] SharedError),

    /// Round trip did not finish within the per-request timeout
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    /// Request context was cancelled while the round trip was in flight
    #[error("Request cancelled: context cancelled")]
    Cancelled,

    /// Response-side middleware rejected a received response
    #[error(transparent)]
    Response(ResponseError),

    /// Multipart body producer failed while streaming a field
    #[error("Multipart field '{field}' failed: {source}")]
    MultipartProducer {
        /// Name of the field being written when the failure happened
        field: String,
        /// Underlying failure
        #[source]
        source: Box<HttpError>,
    },

    /// Several independent failures of one send
    #[error("{}", join_messages(.0))]
    Joined(Vec<HttpError>),
}

fn join_messages(errors: &[HttpError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl HttpError {
    /// Wrap an arbitrary middleware failure.
    pub fn pipeline(err: impl Into<BoxError>) -> Self {
        let boxed: BoxError = err.into();
        HttpError::Pipeline(Arc::from(boxed))
    }

    /// Wrap an arbitrary transport failure.
    pub fn transport(err: impl Into<BoxError>) -> Self {
        let boxed: BoxError = err.into();
        HttpError::Transport(Arc::from(boxed))
    }

    /// Wrap a body factory failure.
    pub fn body_factory(err: impl Into<BoxError>) -> Self {
        let boxed: BoxError = err.into();
        HttpError::BodyFactory(Arc::from(boxed))
    }

    /// TLS setup failure described by a message.
    pub(crate) fn tls(msg: impl Into<String>) -> Self {
        let boxed: BoxError = msg.into().into();
        HttpError::Tls(Arc::from(boxed))
    }

    /// Recover an `HttpError` that travelled through a boxed error slot.
    ///
    /// Anything else is treated as a transport failure.
    #[must_use]
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<HttpError>() {
            Ok(http_err) => *http_err,
            Err(other) => HttpError::Transport(Arc::from(other)),
        }
    }

    /// Combine errors into one.
    ///
    /// Returns `None` for an empty input and the error itself for a single one.
    /// Nested `Joined` values are flattened.
    #[must_use]
    pub fn join(errors: impl IntoIterator<Item = HttpError>) -> Option<HttpError> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                HttpError::Joined(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(HttpError::Joined(flat)),
        }
    }

    /// Whether this error (or any joined part) is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            HttpError::Timeout(_) => true,
            HttpError::Joined(errors) => errors.iter().any(HttpError::is_timeout),
            _ => false,
        }
    }

    /// Whether this error (or any joined part) is a context cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            HttpError::Cancelled => true,
            HttpError::Joined(errors) => errors.iter().any(HttpError::is_cancelled),
            _ => false,
        }
    }
}

impl From<std::convert::Infallible> for HttpError {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

impl From<http::Error> for HttpError {
    fn from(err: http::Error) -> Self {
        HttpError::RequestBuild(Arc::new(err))
    }
}

impl From<http::header::InvalidHeaderName> for HttpError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        HttpError::InvalidHeaderName(Arc::new(err))
    }
}

impl From<http::header::InvalidHeaderValue> for HttpError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        HttpError::InvalidHeaderValue(Arc::new(err))
    }
}

impl From<serde_json::Error> for HttpError {
    fn from(err: serde_json::Error) -> Self {
        HttpError::Json(Arc::new(err))
    }
}

impl From<serde_urlencoded::ser::Error> for HttpError {
    fn from(err: serde_urlencoded::ser::Error) -> Self {
        HttpError::FormEncode(Arc::new(err))
    }
}

impl From<std::io::Error> for HttpError {
    fn from(err: std::io::Error) -> Self {
        HttpError::Io(Arc::new(err))
    }
}

impl From<ResponseError> for HttpError {
    fn from(err: ResponseError) -> Self {
        HttpError::Response(err)
    }
}

impl From<hyper::Error> for HttpError {
    fn from(err: hyper::Error) -> Self {
        HttpError::Transport(Arc::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        HttpError::Transport(Arc::new(err))
    }
}
