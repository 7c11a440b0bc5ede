//! HTTP/1.1: hand-framed request writing, `httparse` response heads, and
//! content-length / chunked body reading.
//!
//! One request at a time per connection. The body reader owns the
//! connection while the response drains and hands it back to the pool once
//! the framing completes cleanly; dropping the reader early closes the
//! socket instead.

use std::sync::Arc;
use std::sync::Weak;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::{Error, ErrorKind, Result};
use crate::pool::{ConnKey, Pool};
use crate::proto::{OutboundBody, RequestHead, ResponseHead};
use crate::request::Body;
use crate::stats::ConnectionRecord;
use crate::transport::MaybeTlsStream;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;
const MAX_CHUNK_LINE: usize = 16 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// An established HTTP/1.1 connection.
pub(crate) struct H1Conn {
    io: MaybeTlsStream,
    /// Bytes read past the previous response's framing.
    buf: BytesMut,
    record: Arc<ConnectionRecord>,
}

impl H1Conn {
    pub fn new(io: MaybeTlsStream, record: Arc<ConnectionRecord>) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(READ_CHUNK),
            record,
        }
    }

    pub fn record(&self) -> &Arc<ConnectionRecord> {
        &self.record
    }

    /// Write the request and read the response head.
    ///
    /// The head's headers go to the wire exactly as given, in order; the
    /// dispatcher owns defaulting and framing headers.
    pub async fn send_request(
        &mut self,
        head: &RequestHead,
        body: OutboundBody,
    ) -> Result<ResponseHead> {
        let chunked = is_chunked(&head.headers);
        let mut prelude = Vec::with_capacity(256);
        write_prelude(&mut prelude, head)?;
        self.io.write_all(&prelude).await?;

        match body {
            OutboundBody::Empty => {}
            OutboundBody::InMemory(bytes) => {
                if chunked {
                    self.write_chunked(&bytes).await?;
                    self.io.write_all(b"0\r\n\r\n").await?;
                } else {
                    self.io.write_all(&bytes).await?;
                }
            }
            OutboundBody::Stream(Body::Stream(mut stream)) => {
                use futures::StreamExt;
                // streaming h1 bodies are always chunk-framed; reading from
                // the caller's stream is the backpressure point
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| {
                        Error::with_source(ErrorKind::BodyStream, "request body stream failed", e)
                    })?;
                    if chunk.is_empty() {
                        continue;
                    }
                    self.write_chunked(&chunk).await?;
                }
                self.io.write_all(b"0\r\n\r\n").await?;
            }
            OutboundBody::Stream(Body::InMemory(bytes)) => {
                if chunked {
                    self.write_chunked(&bytes).await?;
                    self.io.write_all(b"0\r\n\r\n").await?;
                } else {
                    self.io.write_all(&bytes).await?;
                }
            }
        }
        self.io.flush().await?;

        // skip informational responses
        loop {
            let head = self.read_head().await?;
            if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                trace!(status = %head.status, "skipping informational response");
                continue;
            }
            return Ok(head);
        }
    }

    async fn write_chunked(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let size = format!("{:x}\r\n", data.len());
        self.io.write_all(size.as_bytes()).await?;
        self.io.write_all(data).await?;
        self.io.write_all(b"\r\n").await?;
        Ok(())
    }

    async fn read_head(&mut self) -> Result<ResponseHead> {
        loop {
            if let Some(head) = self.try_parse_head()? {
                return Ok(head);
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(Error::new(ErrorKind::Network, "response head too large"));
            }
            let n = self.io.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(Error::new(
                    ErrorKind::Network,
                    "connection closed before response head",
                ));
            }
        }
    }

    fn try_parse_head(&mut self) -> Result<Option<ResponseHead>> {
        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut header_storage);
        match parsed.parse(&self.buf) {
            Ok(httparse::Status::Complete(consumed)) => {
                let status = StatusCode::from_u16(parsed.code.unwrap_or(0)).map_err(|e| {
                    Error::with_source(ErrorKind::Network, "invalid status code", e)
                })?;
                let reason = parsed.reason.map(ToString::to_string);
                let keep_alive_default = parsed.version == Some(1);

                let mut headers = HeaderMap::with_capacity(parsed.headers.len());
                for h in parsed.headers.iter() {
                    let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|e| {
                        Error::with_source(ErrorKind::Network, "invalid response header name", e)
                    })?;
                    let value = HeaderValue::from_bytes(h.value).map_err(|e| {
                        Error::with_source(ErrorKind::Network, "invalid response header value", e)
                    })?;
                    headers.append(name, value);
                }
                {
                    use bytes::Buf;
                    self.buf.advance(consumed);
                }
                let head = ResponseHead {
                    status,
                    reason,
                    headers,
                };
                if !keep_alive_default {
                    // HTTP/1.0 peers without explicit keep-alive close after
                    // the body; the reader treats that as non-reusable
                    trace!("HTTP/1.0 response");
                }
                Ok(Some(head))
            }
            Ok(httparse::Status::Partial) => Ok(None),
            Err(e) => Err(Error::with_source(
                ErrorKind::Network,
                "malformed response head",
                e,
            )),
        }
    }
}

fn write_prelude(out: &mut Vec<u8>, head: &RequestHead) -> Result<()> {
    use std::io::Write;
    write!(out, "{} {} HTTP/1.1\r\n", head.method, head.target)
        .map_err(|e| Error::with_source(ErrorKind::Network, "request serialization failed", e))?;
    for (name, value) in &head.headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    Ok(())
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
}

/// Response body framing for HTTP/1.1.
#[derive(Debug)]
pub(crate) enum Framing {
    /// No body on the wire (HEAD, 204, 304, or Content-Length: 0).
    Empty,
    ContentLength(u64),
    Chunked,
    /// Delimited by connection close; never reusable.
    ReadToEnd,
}

impl Framing {
    pub fn for_response(method: &Method, status: StatusCode, headers: &HeaderMap) -> Self {
        if method == Method::HEAD
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
            || status.is_informational()
        {
            return Self::Empty;
        }
        if is_chunked(headers) {
            return Self::Chunked;
        }
        if let Some(len) = headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            return if len == 0 {
                Self::Empty
            } else {
                Self::ContentLength(len)
            };
        }
        Self::ReadToEnd
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// True when the exchange permits keeping the connection alive afterwards.
pub(crate) fn exchange_reusable(
    request_headers: &HeaderMap,
    response_headers: &HeaderMap,
    framing: &Framing,
) -> bool {
    if matches!(framing, Framing::ReadToEnd) {
        return false;
    }
    let says_close = |headers: &HeaderMap| {
        headers
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("close"))
    };
    !says_close(request_headers) && !says_close(response_headers)
}

#[derive(Debug)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Streaming reader for one h1 response body.
///
/// Owns the connection; returns it to the pool on clean EOF when the
/// exchange was reusable.
pub(crate) struct H1BodyReader {
    conn: Option<H1Conn>,
    framing: H1ReadState,
    reusable: bool,
    pool: Weak<Pool>,
    key: ConnKey,
}

enum H1ReadState {
    ContentLength(u64),
    Chunked(ChunkState),
    ReadToEnd,
    Finished,
}

impl H1BodyReader {
    pub fn new(
        conn: H1Conn,
        framing: Framing,
        reusable: bool,
        pool: Weak<Pool>,
        key: ConnKey,
    ) -> Self {
        let empty = framing.is_empty();
        let framing = match framing {
            Framing::Empty => H1ReadState::Finished,
            Framing::ContentLength(n) => H1ReadState::ContentLength(n),
            Framing::Chunked => H1ReadState::Chunked(ChunkState::Size),
            Framing::ReadToEnd => H1ReadState::ReadToEnd,
        };
        let mut reader = Self {
            conn: Some(conn),
            framing,
            reusable,
            pool,
            key,
        };
        if empty {
            // no body on the wire: the connection is free immediately
            reader.finish();
        }
        reader
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if matches!(self.framing, H1ReadState::Finished) {
            return Ok(None);
        }
        if matches!(self.framing, H1ReadState::Chunked(_)) {
            if let Some(chunk) = self.next_from_chunked().await? {
                return Ok(Some(chunk));
            }
            // chunked framing completed
            self.finish();
            return Ok(None);
        }

        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::ResponseBodyNotAvailable, "response body no longer available"))?;
        match &mut self.framing {
            H1ReadState::ContentLength(remaining) => {
                if conn.buf.is_empty() {
                    let n = conn.io.read_buf(&mut conn.buf).await?;
                    if n == 0 {
                        return Err(Error::new(
                            ErrorKind::BodyStream,
                            "connection closed mid-body",
                        ));
                    }
                }
                let take = usize::try_from((*remaining).min(conn.buf.len() as u64))
                    .unwrap_or(usize::MAX);
                let chunk = conn.buf.split_to(take).freeze();
                *remaining -= chunk.len() as u64;
                let exhausted = *remaining == 0;
                if exhausted {
                    self.finish();
                }
                Ok(Some(chunk))
            }
            H1ReadState::ReadToEnd => {
                if !conn.buf.is_empty() {
                    return Ok(Some(conn.buf.split().freeze()));
                }
                let n = conn.io.read_buf(&mut conn.buf).await?;
                if n == 0 {
                    // close-delimited: EOF is the terminator; never reusable
                    self.framing = H1ReadState::Finished;
                    self.conn = None;
                    return Ok(None);
                }
                Ok(Some(conn.buf.split().freeze()))
            }
            H1ReadState::Finished | H1ReadState::Chunked(_) => Ok(None),
        }
    }

    async fn next_from_chunked(&mut self) -> Result<Option<Bytes>> {
        loop {
            let conn = self
                .conn
                .as_mut()
                .ok_or_else(|| Error::new(ErrorKind::ResponseBodyNotAvailable, "response body no longer available"))?;
            let H1ReadState::Chunked(state) = &mut self.framing else {
                return Ok(None);
            };
            match state {
                ChunkState::Size => {
                    let line = read_line(conn).await?;
                    let size_part = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_part, 16).map_err(|e| {
                        Error::with_source(ErrorKind::BodyStream, "invalid chunk size", e)
                    })?;
                    *state = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if conn.buf.is_empty() {
                        let n = conn.io.read_buf(&mut conn.buf).await?;
                        if n == 0 {
                            return Err(Error::new(
                                ErrorKind::BodyStream,
                                "connection closed mid-chunk",
                            ));
                        }
                    }
                    let take = usize::try_from((*remaining).min(conn.buf.len() as u64))
                        .unwrap_or(usize::MAX);
                    let chunk = conn.buf.split_to(take).freeze();
                    *remaining -= chunk.len() as u64;
                    if *remaining == 0 {
                        *state = ChunkState::DataEnd;
                    }
                    return Ok(Some(chunk));
                }
                ChunkState::DataEnd => {
                    let line = read_line(conn).await?;
                    if !line.is_empty() {
                        return Err(Error::new(
                            ErrorKind::BodyStream,
                            "missing CRLF after chunk data",
                        ));
                    }
                    *state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let line = read_line(conn).await?;
                    if line.is_empty() {
                        *state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(None),
            }
        }
    }

    /// Framing complete: hand the connection back to the pool if reusable.
    fn finish(&mut self) {
        self.framing = H1ReadState::Finished;
        let Some(conn) = self.conn.take() else { return };
        if let Some((rtt, cwnd)) = conn.io.telemetry() {
            conn.record.set_telemetry(rtt, cwnd);
        }
        conn.record.touch();
        conn.record
            .in_use
            .store(false, std::sync::atomic::Ordering::Relaxed);
        if self.reusable {
            if let Some(pool) = self.pool.upgrade() {
                trace!(id = conn.record.id, "returning h1 connection to pool");
                pool.insert_idle(self.key.clone(), conn);
                return;
            }
        }
        debug!(id = conn.record.id, "closing non-reusable h1 connection");
        // dropping conn closes the socket
    }
}

async fn read_line(conn: &mut H1Conn) -> Result<String> {
    loop {
        if let Some(pos) = find_crlf(&conn.buf) {
            let line = conn.buf.split_to(pos + 2);
            let text = std::str::from_utf8(&line[..pos])
                .map_err(|e| Error::with_source(ErrorKind::BodyStream, "non-UTF-8 chunk line", e))?
                .to_string();
            return Ok(text);
        }
        if conn.buf.len() > MAX_CHUNK_LINE {
            return Err(Error::new(ErrorKind::BodyStream, "chunk line too long"));
        }
        let n = conn.io.read_buf(&mut conn.buf).await?;
        if n == 0 {
            return Err(Error::new(
                ErrorKind::BodyStream,
                "connection closed mid-line",
            ));
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_empty_for_head_and_no_content() {
        let headers = HeaderMap::new();
        assert!(Framing::for_response(&Method::HEAD, StatusCode::OK, &headers).is_empty());
        assert!(Framing::for_response(&Method::GET, StatusCode::NO_CONTENT, &headers).is_empty());
        assert!(Framing::for_response(&Method::GET, StatusCode::NOT_MODIFIED, &headers).is_empty());
    }

    #[test]
    fn framing_prefers_chunked_over_length() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert(http::header::CONTENT_LENGTH, "10".parse().unwrap());
        assert!(matches!(
            Framing::for_response(&Method::GET, StatusCode::OK, &headers),
            Framing::Chunked
        ));
    }

    #[test]
    fn framing_reads_to_end_without_length() {
        let headers = HeaderMap::new();
        assert!(matches!(
            Framing::for_response(&Method::GET, StatusCode::OK, &headers),
            Framing::ReadToEnd
        ));
    }

    #[test]
    fn reusability_respects_connection_close() {
        let clean = HeaderMap::new();
        let mut closing = HeaderMap::new();
        closing.insert(http::header::CONNECTION, "close".parse().unwrap());

        let framing = Framing::ContentLength(5);
        assert!(exchange_reusable(&clean, &clean, &framing));
        assert!(!exchange_reusable(&closing, &clean, &framing));
        assert!(!exchange_reusable(&clean, &closing, &framing));
        assert!(!exchange_reusable(&clean, &clean, &Framing::ReadToEnd));
    }

    #[test]
    fn prelude_writes_request_line_and_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, "example.com".parse().unwrap());
        headers.append("x-a", "1".parse().unwrap());
        headers.append("x-a", "2".parse().unwrap());
        let head = RequestHead {
            method: Method::GET,
            scheme: "http",
            authority: "example.com".into(),
            target: "/path?q=1".into(),
            headers,
        };
        let mut out = Vec::new();
        write_prelude(&mut out, &head).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("GET /path?q=1 HTTP/1.1\r\n"));
        assert!(text.contains("host: example.com\r\n"));
        // duplicates preserved in order
        let first = text.find("x-a: 1").unwrap();
        let second = text.find("x-a: 2").unwrap();
        assert!(first < second);
        assert!(text.ends_with("\r\n\r\n"));
    }
}
