//! Request options and body input coercion.
//!
//! `RequestOptions` mirrors the fetch options bag; unset fields fall back to
//! the agent defaults during policy merge in the dispatcher.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use http::{HeaderMap, Method};
use url::Url;

use crate::agent::Agent;
use crate::error::{Error, ErrorKind, Result};
use crate::signal::AbortSignal;

/// How redirects are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
    /// Follow up to the hop limit, rewriting to GET for 301/302/303 per Fetch.
    #[default]
    Follow,
    /// Return the 3xx response as-is, `redirected = false`.
    Stop,
    /// Fail with `RedirectDisallowed`.
    Error,
}

/// Cookie and URL-credential scoping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Credentials {
    #[default]
    Include,
    /// Treated as `Include`; there is no document origin to compare against.
    SameOrigin,
    /// No `Cookie` sent, no `Set-Cookie` retained, URL credentials stripped.
    Omit,
}

impl Credentials {
    pub(crate) fn send_credentials(self) -> bool {
        !matches!(self, Self::Omit)
    }
}

/// Cache interaction modes, agent-level default and per-request override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Serve fresh entries, revalidate stale ones, store responses.
    #[default]
    Default,
    /// Neither read nor write the cache.
    NoStore,
    /// Skip lookup; store the response.
    Reload,
    /// Always revalidate; use 304 to refresh.
    NoCache,
    /// Serve any stored entry regardless of freshness; else fetch and store.
    ForceCache,
    /// Serve the stored entry or fail with `NotCached`. No network.
    OnlyIfCached,
    /// Serve any stored entry ignoring `no-store`/`no-cache` in stored
    /// headers; writes follow default policy.
    IgnoreRules,
}

/// Streaming request bodies must declare half duplex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplex {
    Half,
}

/// Connect / read / total budgets, each optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeouts {
    /// Budgets the whole happy-eyeballs connect phase.
    pub connect: Option<Duration>,
    /// Budgets inter-chunk idle on the body stream.
    pub read: Option<Duration>,
    /// Wall clock spanning connect + send + response head (not body).
    pub total: Option<Duration>,
}

impl Timeouts {
    /// Request values overlaid on agent defaults.
    pub(crate) fn merged_over(self, defaults: Timeouts) -> Timeouts {
        Timeouts {
            connect: self.connect.or(defaults.connect),
            read: self.read.or(defaults.read),
            total: self.total.or(defaults.total),
        }
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + 'static>>;

/// A request body: in-memory bytes or an async byte source.
pub enum Body {
    InMemory(Bytes),
    Stream(ByteStream),
}

impl Body {
    /// Wrap an async byte source. Requires `duplex: Duplex::Half` on the
    /// request options.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        Self::Stream(Box::pin(stream))
    }

    /// Known size for in-memory bodies, `None` for streams.
    pub(crate) fn len(&self) -> Option<usize> {
        match self {
            Self::InMemory(bytes) => Some(bytes.len()),
            Self::Stream(_) => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InMemory(bytes) => f.debug_tuple("InMemory").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Self::InMemory(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Self::InMemory(Bytes::from(value))
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Self::InMemory(Bytes::from(value))
    }
}

impl From<&[u8]> for Body {
    fn from(value: &[u8]) -> Self {
        Self::InMemory(Bytes::copy_from_slice(value))
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Self::InMemory(value)
    }
}

/// Per-request options. Unset fields inherit the agent defaults.
#[derive(Debug, Default)]
pub struct RequestOptions {
    pub method: Option<Method>,
    pub headers: HeaderMap,
    pub body: Option<Body>,
    pub timeout: Timeouts,
    pub credentials: Option<Credentials>,
    pub duplex: Option<Duplex>,
    pub signal: Option<AbortSignal>,
    /// SRI metadata, e.g. `sha256-<base64> sha384-<base64>`.
    pub integrity: Option<String>,
    pub cache: Option<CacheMode>,
    pub redirect: Option<RedirectMode>,
    /// Route through a specific agent instead of the process default.
    pub agent: Option<Agent>,
}

impl RequestOptions {
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = http::HeaderName::from_bytes(name.as_bytes())?;
        self.headers.append(name, http::HeaderValue::from_str(value)?);
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Methods fetch forbids outright.
const FORBIDDEN_METHODS: &[&str] = &["CONNECT", "TRACE", "TRACK"];

/// Methods normalised to uppercase per Fetch.
const NORMALISED_METHODS: &[&str] = &["DELETE", "GET", "HEAD", "OPTIONS", "POST", "PUT"];

/// Validate and normalise a method the way fetch does.
pub(crate) fn validate_method(method: &Method) -> Result<Method> {
    let upper = method.as_str().to_ascii_uppercase();
    if FORBIDDEN_METHODS.contains(&upper.as_str()) {
        return Err(Error::new(
            ErrorKind::InvalidMethod,
            format!("method {} is forbidden", method),
        ));
    }
    if NORMALISED_METHODS.contains(&upper.as_str()) {
        return Method::from_bytes(upper.as_bytes())
            .map_err(|e| Error::with_source(ErrorKind::InvalidMethod, "invalid method", e));
    }
    Ok(method.clone())
}

/// Parse and validate a request URL.
pub(crate) fn validate_url(input: &str) -> Result<Url> {
    let url = Url::parse(input)?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::new(
                ErrorKind::InvalidUrl,
                format!("unsupported scheme {other:?}"),
            ));
        }
    }
    if url.host_str().is_none() {
        return Err(Error::new(ErrorKind::InvalidUrl, "URL has no host"));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_normalisation() {
        let m = Method::from_bytes(b"get").unwrap();
        assert_eq!(validate_method(&m).unwrap(), Method::GET);
        // non-listed methods keep their case
        let m = Method::from_bytes(b"Purge").unwrap();
        assert_eq!(validate_method(&m).unwrap().as_str(), "Purge");
    }

    #[test]
    fn forbidden_methods_rejected() {
        for name in ["CONNECT", "trace", "Track"] {
            let m = Method::from_bytes(name.as_bytes()).unwrap();
            let err = validate_method(&m).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidMethod);
        }
    }

    #[test]
    fn url_scheme_validation() {
        assert!(validate_url("http://example.com/x").is_ok());
        assert!(validate_url("https://example.com").is_ok());
        assert_eq!(
            validate_url("ftp://example.com").unwrap_err().kind(),
            ErrorKind::InvalidUrl
        );
        assert_eq!(
            validate_url("not a url").unwrap_err().kind(),
            ErrorKind::InvalidUrl
        );
    }

    #[test]
    fn body_len_known_only_in_memory() {
        let body = Body::from("hello");
        assert_eq!(body.len(), Some(5));
        let body = Body::stream(futures::stream::empty());
        assert_eq!(body.len(), None);
    }

    #[test]
    fn timeouts_merge_prefers_request() {
        let agent = Timeouts {
            connect: Some(Duration::from_secs(10)),
            read: Some(Duration::from_secs(30)),
            total: None,
        };
        let request = Timeouts {
            connect: Some(Duration::from_secs(1)),
            ..Timeouts::default()
        };
        let merged = request.merged_over(agent);
        assert_eq!(merged.connect, Some(Duration::from_secs(1)));
        assert_eq!(merged.read, Some(Duration::from_secs(30)));
        assert_eq!(merged.total, None);
    }
}
