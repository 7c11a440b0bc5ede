//! The response surface handed back to callers.
//!
//! Drain methods (`text`, `bytes`, `json`, `blob`, `array_buffer`) and
//! stream access are pairwise mutually exclusive on one response; a second
//! consumption attempt fails with `ResponseAlreadyDisturbed`. `clone()`
//! duplicates the response while the body is still fresh.

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;
use url::Url;

use crate::body::{BodyReader, ResponseBody};
use crate::error::{Error, ErrorKind, Result};

/// TLS peer details for the connection that served this response.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Remote `ip:port`.
    pub address: String,
    /// DER-encoded leaf certificate; `None` for plaintext connections.
    pub certificate: Option<Vec<u8>>,
}

/// A drained body with its media type, fetch-`blob()` style.
#[derive(Debug, Clone)]
pub struct Blob {
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// An HTTP response.
pub struct Response {
    status: StatusCode,
    status_text: String,
    headers: HeaderMap,
    url: Url,
    redirected: bool,
    version: Version,
    peer: Option<PeerInfo>,
    body: ResponseBody,
}

impl Response {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        status: StatusCode,
        reason: Option<String>,
        headers: HeaderMap,
        url: Url,
        redirected: bool,
        version: Version,
        peer: Option<PeerInfo>,
        body: ResponseBody,
    ) -> Self {
        let status_text = reason.unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or_default()
                .to_string()
        });
        Self {
            status,
            status_text,
            headers,
            url,
            redirected,
            version,
            peer,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    /// True for 200–299.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The final URL after any redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn redirected(&self) -> bool {
        self.redirected
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// `HTTP/1.1`, `HTTP/2.0`, or `HTTP/3.0`.
    pub fn version_str(&self) -> &'static str {
        match self.version {
            Version::HTTP_2 => "HTTP/2.0",
            Version::HTTP_3 => "HTTP/3.0",
            _ => "HTTP/1.1",
        }
    }

    pub fn peer(&self) -> Option<&PeerInfo> {
        self.peer.as_ref()
    }

    /// Responses are always plain client fetches here; no CORS filtering.
    pub fn response_type(&self) -> &'static str {
        "basic"
    }

    /// True once any drain method or stream access has run.
    pub fn body_used(&self) -> bool {
        self.body.is_disturbed()
    }

    /// Raw decoded bytes of the whole body.
    pub async fn bytes(&self) -> Result<Bytes> {
        self.body.drain().await
    }

    /// The body as UTF-8 text.
    pub async fn text(&self) -> Result<String> {
        let bytes = self.body.drain().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::with_source(ErrorKind::Utf8Parse, "body is not valid UTF-8", e))
    }

    /// The body parsed as JSON.
    pub async fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = self.body.drain().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::with_source(ErrorKind::JsonParse, "body is not valid JSON", e))
    }

    /// The body as a contiguous buffer, `arrayBuffer()` style.
    pub async fn array_buffer(&self) -> Result<Vec<u8>> {
        Ok(self.body.drain().await?.to_vec())
    }

    /// The body plus its media type.
    pub async fn blob(&self) -> Result<Blob> {
        let content_type = self
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let bytes = self.body.drain().await?;
        Ok(Blob {
            content_type,
            bytes,
        })
    }

    /// Streaming access to the body. Mutually exclusive with the drain
    /// methods.
    pub fn body(&self) -> Result<BodyReader> {
        self.body.reader()
    }

    /// Duplicate the response. Legal only while the body is fresh; both
    /// responses drain identical bytes from one underlying stream.
    pub fn clone_response(&self) -> Result<Self> {
        let body = self.body.try_clone()?;
        Ok(Self {
            status: self.status,
            status_text: self.status_text.clone(),
            headers: self.headers.clone(),
            url: self.url.clone(),
            redirected: self.redirected,
            version: self.version,
            peer: self.peer.clone(),
            body,
        })
    }

    /// A standard `http` crate view over the same (still-lazy) body.
    pub fn into_http(self) -> Result<http::Response<BodyReader>> {
        let reader = self.body.reader()?;
        let mut builder = http::Response::builder()
            .status(self.status)
            .version(self.version);
        if let Some(headers) = builder.headers_mut() {
            *headers = self.headers;
        }
        builder
            .body(reader)
            .map_err(|e| Error::with_source(ErrorKind::Network, "response view build failed", e))
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("version", &self.version)
            .field("redirected", &self.redirected)
            .field("body_used", &self.body_used())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::ResponseBody;

    fn response_with_body(body: ResponseBody) -> Response {
        Response::new(
            StatusCode::OK,
            None,
            HeaderMap::new(),
            Url::parse("http://example.com/").unwrap(),
            false,
            Version::HTTP_11,
            None,
            body,
        )
    }

    #[tokio::test]
    async fn drain_methods_are_mutually_exclusive() {
        let resp = response_with_body(ResponseBody::from_bytes(Bytes::from_static(b"{\"a\":1}")));
        assert!(!resp.body_used());
        let text = resp.text().await.unwrap();
        assert_eq!(text, "{\"a\":1}");
        assert!(resp.body_used());
        let err = resp.json::<serde_json::Value>().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResponseAlreadyDisturbed);
    }

    #[tokio::test]
    async fn json_parses_and_flags_bad_input() {
        let resp = response_with_body(ResponseBody::from_bytes(Bytes::from_static(b"{\"a\":1}")));
        let value: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(value["a"], 1);

        let resp = response_with_body(ResponseBody::from_bytes(Bytes::from_static(b"not json")));
        let err = resp.json::<serde_json::Value>().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::JsonParse);
    }

    #[tokio::test]
    async fn text_flags_invalid_utf8() {
        let resp = response_with_body(ResponseBody::from_bytes(Bytes::from_static(&[0xff, 0xfe])));
        let err = resp.text().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Utf8Parse);
    }

    #[tokio::test]
    async fn blob_carries_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, "text/plain".parse().unwrap());
        let resp = Response::new(
            StatusCode::OK,
            None,
            headers,
            Url::parse("http://example.com/").unwrap(),
            false,
            Version::HTTP_11,
            None,
            ResponseBody::from_bytes(Bytes::from_static(b"blob")),
        );
        let blob = resp.blob().await.unwrap();
        assert_eq!(blob.content_type.as_deref(), Some("text/plain"));
        assert_eq!(&blob.bytes[..], b"blob");
    }

    #[tokio::test]
    async fn clone_then_both_drain() {
        let resp = response_with_body(ResponseBody::from_bytes(Bytes::from_static(b"twice")));
        let clone = resp.clone_response().unwrap();
        assert_eq!(resp.text().await.unwrap(), "twice");
        assert_eq!(clone.text().await.unwrap(), "twice");
        // cloning a drained response fails
        assert!(resp.clone_response().is_err());
    }

    #[tokio::test]
    async fn http_view_preserves_head_and_body() {
        let resp = response_with_body(ResponseBody::from_bytes(Bytes::from_static(b"view")));
        let http_resp = resp.into_http().unwrap();
        assert_eq!(http_resp.status(), StatusCode::OK);
        let mut reader = http_resp.into_body();
        let mut out = Vec::new();
        while let Some(chunk) = reader.chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"view");
    }

    #[test]
    fn version_strings() {
        let resp = response_with_body(ResponseBody::settled_empty());
        assert_eq!(resp.version_str(), "HTTP/1.1");
        assert_eq!(resp.response_type(), "basic");
    }

    #[test]
    fn status_text_falls_back_to_canonical() {
        let resp = Response::new(
            StatusCode::NOT_FOUND,
            None,
            HeaderMap::new(),
            Url::parse("http://example.com/").unwrap(),
            false,
            Version::HTTP_2,
            None,
            ResponseBody::settled_empty(),
        );
        assert_eq!(resp.status_text(), "Not Found");
        assert!(!resp.ok());
    }
}
