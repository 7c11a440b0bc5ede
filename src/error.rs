//! Error type shared across the crate.
//!
//! Every error carries a stable [`ErrorKind`], a human-readable message, and
//! an optional underlying cause. Callers match on the kind; the message is
//! for humans and logs.

use std::fmt;

/// Stable error kinds.
///
/// `Aborted` and `Timeout` both terminate I/O but remain distinguishable:
/// the former comes from the caller's signal, the latter from a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The request was cancelled via its abort signal.
    Aborted,
    /// The response body stream failed mid-read.
    BodyStream,
    /// DNS returned no records for the host.
    DnsNotFound,
    /// An explicit empty DNS override blocked resolution.
    DnsBlocked,
    /// The DNS query exceeded its budget.
    DnsTimeout,
    /// No listed integrity digest matched the drained body.
    IntegrityMismatch,
    /// URL credentials could not be applied.
    InvalidCredentials,
    /// A header name or value was malformed.
    InvalidHeader,
    /// The integrity list contained no recognised algorithm.
    InvalidIntegrity,
    /// The request method was not a valid HTTP token.
    InvalidMethod,
    /// The request URL failed to parse or had an unsupported scheme.
    InvalidUrl,
    /// `json()` failed to parse the drained body.
    JsonParse,
    /// A socket-level failure (connect, read, write).
    Network,
    /// `only-if-cached` found no stored entry.
    NotCached,
    /// A redirect arrived while `redirect: "error"` was set.
    RedirectDisallowed,
    /// A second drain, stream, or clone on a disturbed body handle.
    ResponseAlreadyDisturbed,
    /// The body was consumed internally and is no longer available.
    ResponseBodyNotAvailable,
    /// The TLS or QUIC handshake failed.
    TlsHandshake,
    /// The redirect chain exceeded the hop limit.
    TooManyRedirects,
    /// A connect, read, or total budget expired.
    Timeout,
    /// `text()` found invalid UTF-8.
    Utf8Parse,
}

impl ErrorKind {
    /// The stable identifier for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aborted => "Aborted",
            Self::BodyStream => "BodyStream",
            Self::DnsNotFound => "DnsNotFound",
            Self::DnsBlocked => "DnsBlocked",
            Self::DnsTimeout => "DnsTimeout",
            Self::IntegrityMismatch => "IntegrityMismatch",
            Self::InvalidCredentials => "InvalidCredentials",
            Self::InvalidHeader => "InvalidHeader",
            Self::InvalidIntegrity => "InvalidIntegrity",
            Self::InvalidMethod => "InvalidMethod",
            Self::InvalidUrl => "InvalidUrl",
            Self::JsonParse => "JsonParse",
            Self::Network => "Network",
            Self::NotCached => "NotCached",
            Self::RedirectDisallowed => "RedirectDisallowed",
            Self::ResponseAlreadyDisturbed => "ResponseAlreadyDisturbed",
            Self::ResponseBodyNotAvailable => "ResponseBodyNotAvailable",
            Self::TlsHandshake => "TlsHandshake",
            Self::TooManyRedirects => "TooManyRedirects",
            Self::Timeout => "Timeout",
            Self::Utf8Parse => "Utf8Parse",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The crate error type: `(kind, message, optional cause)`.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Cause>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl Into<Cause>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// The stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// True if the error is of the given kind.
    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::with_source(ErrorKind::Timeout, "i/o timed out", err),
            _ => Self::with_source(ErrorKind::Network, "i/o failure", err),
        }
    }
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        Self::with_source(ErrorKind::InvalidHeader, "invalid header name", err)
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Self::with_source(ErrorKind::InvalidHeader, "invalid header value", err)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::with_source(ErrorKind::InvalidUrl, "invalid URL", err)
    }
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
