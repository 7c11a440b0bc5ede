//! HTTP/3 driver on top of `h3` + `h3-quinn` + `quinn`.
//!
//! The QUIC session is pooled as a whole: one handshake, one background
//! driver task, many request streams. Opening a stream takes a short async
//! lock on the shared sender; the stream itself is independent afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use futures::StreamExt;
use http::{Request, Uri};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, ErrorKind, Result};
use crate::proto::{OutboundBody, RequestHead, ResponseHead};
use crate::request::Body;
use crate::stats::ConnectionRecord;

type H3Sender = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;
type H3Stream = h3::client::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

/// QUIC allows effectively unbounded streams; this is the advertisory value
/// surfaced in connection records.
const ADVERTISED_CONCURRENT_STREAMS: u32 = 100;

/// Shared handle to one HTTP/3 session.
#[derive(Clone)]
pub(crate) struct H3Handle {
    sender: Arc<Mutex<H3Sender>>,
    connection: quinn::Connection,
    record: Arc<ConnectionRecord>,
    closed: Arc<AtomicBool>,
}

impl H3Handle {
    /// Establish the h3 layer over an already-handshaken QUIC connection
    /// and spawn the driver task.
    pub async fn handshake(
        connection: quinn::Connection,
        record: Arc<ConnectionRecord>,
    ) -> Result<Self> {
        let (mut driver, sender) = h3::client::new(h3_quinn::Connection::new(connection.clone()))
            .await
            .map_err(|e| Error::with_source(ErrorKind::Network, "h3 handshake failed", e))?;

        record
            .max_concurrent_streams
            .store(ADVERTISED_CONCURRENT_STREAMS, Ordering::Relaxed);

        let closed = Arc::new(AtomicBool::new(false));
        let closed_flag = Arc::clone(&closed);
        let conn_id = record.id;
        tokio::spawn(async move {
            let err = futures::future::poll_fn(|cx| driver.poll_close(cx)).await;
            debug!(id = conn_id, error = ?err, "h3 driver closed");
            closed_flag.store(true, Ordering::Relaxed);
        });

        Ok(Self {
            sender: Arc::new(Mutex::new(sender)),
            connection,
            record,
            closed,
        })
    }

    pub fn record(&self) -> &Arc<ConnectionRecord> {
        &self.record
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
            || self.connection.close_reason().is_some()
    }

    pub fn at_capacity(&self) -> bool {
        let max = self.record.max_concurrent_streams.load(Ordering::Relaxed) as usize;
        max != 0 && self.record.live_streams.load(Ordering::Relaxed) >= max
    }

    /// Close the whole QUIC session.
    pub fn close(&self) {
        self.connection.close(0u32.into(), b"client shutdown");
    }

    /// Send one request over a fresh bidirectional stream.
    pub async fn send_request(
        &self,
        head: &RequestHead,
        body: OutboundBody,
    ) -> Result<(ResponseHead, H3BodyReader)> {
        let uri: Uri = format!("{}://{}{}", head.scheme, head.authority, head.target)
            .parse()
            .map_err(|e: http::uri::InvalidUri| {
                Error::with_source(ErrorKind::InvalidUrl, "request URI rejected", e)
            })?;

        // h3 derives :authority from the URI; host would be duplicated
        let mut builder = Request::builder().method(head.method.clone()).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in &head.headers {
                if name == http::header::HOST || name == http::header::TRANSFER_ENCODING {
                    continue;
                }
                headers.append(name.clone(), value.clone());
            }
        }
        let request = builder
            .body(())
            .map_err(|e| Error::with_source(ErrorKind::InvalidHeader, "request build failed", e))?;

        let mut stream = {
            let mut sender = self.sender.lock().await;
            sender
                .send_request(request)
                .await
                .map_err(|e| Error::with_source(ErrorKind::Network, "h3 send_request failed", e))?
        };

        let guard = StreamGuard::acquire(Arc::clone(&self.record));

        match body {
            OutboundBody::Empty => {}
            OutboundBody::InMemory(bytes) | OutboundBody::Stream(Body::InMemory(bytes)) => {
                if !bytes.is_empty() {
                    stream.send_data(bytes).await.map_err(|e| {
                        Error::with_source(ErrorKind::Network, "h3 body send failed", e)
                    })?;
                }
            }
            OutboundBody::Stream(Body::Stream(mut source)) => {
                while let Some(chunk) = source.next().await {
                    let chunk = chunk.map_err(|e| {
                        Error::with_source(ErrorKind::BodyStream, "request body stream failed", e)
                    })?;
                    if !chunk.is_empty() {
                        stream.send_data(chunk).await.map_err(|e| {
                            Error::with_source(ErrorKind::Network, "h3 body send failed", e)
                        })?;
                    }
                }
            }
        }
        stream
            .finish()
            .await
            .map_err(|e| Error::with_source(ErrorKind::Network, "h3 request finish failed", e))?;

        let response = stream
            .recv_response()
            .await
            .map_err(|e| Error::with_source(ErrorKind::Network, "h3 response failed", e))?;
        let (parts, ()) = response.into_parts();
        trace!(status = %parts.status, "h3 response head");

        Ok((
            ResponseHead {
                status: parts.status,
                reason: None,
                headers: parts.headers,
            },
            H3BodyReader {
                stream,
                _guard: guard,
            },
        ))
    }
}

struct StreamGuard {
    record: Arc<ConnectionRecord>,
}

impl StreamGuard {
    fn acquire(record: Arc<ConnectionRecord>) -> Self {
        record.live_streams.fetch_add(1, Ordering::Relaxed);
        Self { record }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.record.live_streams.fetch_sub(1, Ordering::Relaxed);
        self.record.touch();
    }
}

/// Streaming reader for one h3 response body. Dropping it before EOF resets
/// the stream.
pub(crate) struct H3BodyReader {
    stream: H3Stream,
    _guard: StreamGuard,
}

impl H3BodyReader {
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.stream.recv_data().await {
            Ok(Some(mut buf)) => {
                let mut out = Vec::with_capacity(buf.remaining());
                while buf.has_remaining() {
                    let chunk = buf.chunk();
                    out.extend_from_slice(chunk);
                    let len = chunk.len();
                    buf.advance(len);
                }
                Ok(Some(Bytes::from(out)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(Error::with_source(
                ErrorKind::BodyStream,
                "h3 body stream failed",
                e,
            )),
        }
    }
}
