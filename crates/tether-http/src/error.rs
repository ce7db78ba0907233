//! Error types for the HTTP engine.
//!
//! Three families of error exist:
//!
//! - [`NetworkError`]: the transport failed below the HTTP layer, or the
//!   request could not be carried out (challenge cancelled, body unreadable).
//!   Delivered in [`Response::network_error`](crate::Response::network_error).
//! - [`HttpError`]: a final response arrived with a status of 300 or above
//!   that the redirect policy did not resolve. Its code is the status code.
//!   Delivered in [`Response::http_error`](crate::Response::http_error).
//! - [`Error`]: errors returned synchronously by the few APIs that can fail
//!   immediately, and the combined view returned by
//!   [`Response::error`](crate::Response::error).

use std::path::PathBuf;

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// The request timed out.
    #[error("request timed out")]
    Timeout,
    /// Connecting to the server failed (DNS, refused, reset).
    #[error("connection error: {0}")]
    Connection(String),
    /// The TLS handshake failed for a reason other than an untrusted certificate.
    #[error("TLS error: {0}")]
    Tls(String),
    /// The server certificate was not trusted and the trust decision said no.
    #[error("the certificate for {host} is not trusted")]
    UntrustedCertificate {
        /// Host under challenge.
        host: String,
    },
    /// The server requires authentication and nobody was asked.
    #[error("{host} requires authorization")]
    AuthorizationRequired {
        /// Host under challenge.
        host: String,
    },
    /// The authentication handler cancelled the challenge.
    #[error("authorization for {host} was cancelled")]
    AuthorizationCancelled {
        /// Host under challenge.
        host: String,
    },
    /// The request body could not be produced (missing file, stream already
    /// consumed and not re-creatable).
    #[error("request body unavailable: {0}")]
    BodyStream(String),
    /// A local I/O error, for example writing the response file.
    #[error("I/O error: {0}")]
    Io(String),
    /// The redirect limit was exceeded.
    #[error("too many redirects")]
    TooManyRedirects,
    /// The event thread refused the operation.
    #[error("the event thread is not running")]
    EventThreadUnavailable,
    /// Any other transport failure, with the transport's own message.
    #[error("HTTP request error: {0}")]
    Request(String),
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else if err.is_redirect() {
            Self::TooManyRedirects
        } else {
            Self::Request(err.to_string())
        }
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// A final HTTP status of 300 or above.
///
/// Its [`code`](Self::code) is the status code itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("HTTP {status}{}", reason.as_deref().map(|r| format!(" {r}")).unwrap_or_default())]
pub struct HttpError {
    /// The HTTP status code.
    pub status: u16,
    /// The canonical reason phrase, if the status has one.
    pub reason: Option<String>,
}

impl HttpError {
    /// Create the error for a status code.
    pub fn from_status(status: u16) -> Self {
        let reason = http::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .map(str::to_string);
        Self { status, reason }
    }

    /// The error code, which equals the HTTP status.
    pub fn code(&self) -> u16 {
        self.status
    }
}

/// Errors returned synchronously, and the combined response error view.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The request URL is missing, malformed, or not absolute http/https.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// The operation is not in a state that allows the call.
    #[error("invalid operation state: {0}")]
    InvalidState(String),
    /// A header name or value was rejected.
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    /// A custom method is not a valid HTTP token.
    #[error("invalid method: {0}")]
    InvalidMethod(String),
    /// A final HTTP status error.
    #[error(transparent)]
    Http(#[from] HttpError),
    /// A transport-level error.
    #[error(transparent)]
    Network(#[from] NetworkError),
    /// Moving the response file failed.
    #[error("failed to move response file to {path}: {message}")]
    FileMove {
        /// The requested destination.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}

/// A specialized Result type for HTTP operations.
pub type Result<T> = std::result::Result<T, Error>;
