//! HTTP/2 driver on top of the `h2` crate.
//!
//! One handle per connection; clones share the multiplexed sender. The
//! connection task runs in the background and flips a closed flag when the
//! peer goes away, which is how the pool prunes dead entries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, Request, Uri};
use tracing::{debug, trace};

use crate::error::{Error, ErrorKind, Result};
use crate::proto::{OutboundBody, RequestHead, ResponseHead};
use crate::request::Body;
use crate::stats::ConnectionRecord;
use crate::transport::MaybeTlsStream;

/// Default concurrent-stream assumption until SETTINGS says otherwise; the
/// `h2` crate enforces the peer's real limit either way.
const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

/// Shared handle to one HTTP/2 connection.
#[derive(Clone)]
pub(crate) struct H2Handle {
    sender: h2::client::SendRequest<Bytes>,
    record: Arc<ConnectionRecord>,
    closed: Arc<AtomicBool>,
}

impl H2Handle {
    /// Perform the h2 handshake and spawn the connection driver.
    pub async fn handshake(io: MaybeTlsStream, record: Arc<ConnectionRecord>) -> Result<Self> {
        let (sender, connection) = h2::client::handshake(io)
            .await
            .map_err(|e| Error::with_source(ErrorKind::Network, "h2 handshake failed", e))?;

        record
            .max_concurrent_streams
            .store(DEFAULT_MAX_CONCURRENT_STREAMS, Ordering::Relaxed);

        let closed = Arc::new(AtomicBool::new(false));
        let closed_flag = Arc::clone(&closed);
        let conn_id = record.id;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(id = conn_id, error = %err, "h2 connection terminated");
            }
            closed_flag.store(true, Ordering::Relaxed);
        });

        Ok(Self {
            sender,
            record,
            closed,
        })
    }

    pub fn record(&self) -> &Arc<ConnectionRecord> {
        &self.record
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn live_streams(&self) -> usize {
        self.record.live_streams.load(Ordering::Relaxed)
    }

    pub fn at_capacity(&self) -> bool {
        let max = self.record.max_concurrent_streams.load(Ordering::Relaxed) as usize;
        max != 0 && self.live_streams() >= max
    }

    /// Send one request over a fresh stream.
    pub async fn send_request(
        &self,
        head: &RequestHead,
        body: OutboundBody,
    ) -> Result<(ResponseHead, H2BodyReader)> {
        let uri: Uri = format!("{}://{}{}", head.scheme, head.authority, head.target)
            .parse()
            .map_err(|e: http::uri::InvalidUri| {
                Error::with_source(ErrorKind::InvalidUrl, "request URI rejected", e)
            })?;

        let mut builder = Request::builder().method(head.method.clone()).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in &head.headers {
                if is_connection_level(name) {
                    continue;
                }
                headers.append(name.clone(), value.clone());
            }
        }
        let request = builder
            .body(())
            .map_err(|e| Error::with_source(ErrorKind::InvalidHeader, "request build failed", e))?;

        let mut sender = self
            .sender
            .clone()
            .ready()
            .await
            .map_err(|e| Error::with_source(ErrorKind::Network, "h2 connection not ready", e))?;

        let end_stream = body.is_empty();
        let (response_fut, mut send_stream) = sender
            .send_request(request, end_stream)
            .map_err(|e| Error::with_source(ErrorKind::Network, "h2 send_request failed", e))?;

        let guard = StreamGuard::acquire(Arc::clone(&self.record));

        if !end_stream {
            match body {
                OutboundBody::Empty => {}
                OutboundBody::InMemory(bytes) => {
                    send_all(&mut send_stream, bytes, true).await?;
                }
                OutboundBody::Stream(Body::InMemory(bytes)) => {
                    send_all(&mut send_stream, bytes, true).await?;
                }
                OutboundBody::Stream(Body::Stream(mut stream)) => {
                    while let Some(chunk) = stream.next().await {
                        let chunk = chunk.map_err(|e| {
                            Error::with_source(
                                ErrorKind::BodyStream,
                                "request body stream failed",
                                e,
                            )
                        })?;
                        if !chunk.is_empty() {
                            send_all(&mut send_stream, chunk, false).await?;
                        }
                    }
                    send_stream
                        .send_data(Bytes::new(), true)
                        .map_err(|e| Error::with_source(ErrorKind::Network, "h2 body end failed", e))?;
                }
            }
        }

        let response = response_fut
            .await
            .map_err(|e| Error::with_source(ErrorKind::Network, "h2 response failed", e))?;
        let (parts, recv) = response.into_parts();
        trace!(status = %parts.status, "h2 response head");

        Ok((
            ResponseHead {
                status: parts.status,
                reason: None,
                headers: parts.headers,
            },
            H2BodyReader {
                recv,
                _guard: guard,
            },
        ))
    }
}

fn is_connection_level(name: &http::HeaderName) -> bool {
    matches!(
        name.as_str(),
        "host" | "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade"
    )
}

/// Flow-control-aware write of one buffer, optionally ending the stream.
async fn send_all(
    stream: &mut h2::SendStream<Bytes>,
    mut data: Bytes,
    end: bool,
) -> Result<()> {
    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        let granted = futures::future::poll_fn(|cx| stream.poll_capacity(cx))
            .await
            .ok_or_else(|| Error::new(ErrorKind::Network, "h2 stream closed while sending"))?
            .map_err(|e| Error::with_source(ErrorKind::Network, "h2 capacity failed", e))?;
        let n = granted.min(data.len());
        let chunk = data.split_to(n);
        let last = end && data.is_empty();
        stream
            .send_data(chunk, last)
            .map_err(|e| Error::with_source(ErrorKind::Network, "h2 send_data failed", e))?;
        if last {
            return Ok(());
        }
    }
    if end {
        stream
            .send_data(Bytes::new(), true)
            .map_err(|e| Error::with_source(ErrorKind::Network, "h2 body end failed", e))?;
    }
    Ok(())
}

/// Holds one slot of the connection's concurrency budget.
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

/// Streaming reader for one h2 response body. Dropping it before EOF resets
/// the stream.
pub(crate) struct H2BodyReader {
    recv: h2::RecvStream,
    _guard: StreamGuard,
}

impl H2BodyReader {
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.recv.data().await {
            Some(Ok(bytes)) => {
                let _ = self.recv.flow_control().release_capacity(bytes.len());
                Ok(Some(bytes))
            }
            Some(Err(e)) => Err(Error::with_source(
                ErrorKind::BodyStream,
                "h2 body stream failed",
                e,
            )),
            None => {
                // drain trailers so the stream closes cleanly
                let _trailers: Option<HeaderMap> = self
                    .recv
                    .trailers()
                    .await
                    .map_err(|e| Error::with_source(ErrorKind::BodyStream, "h2 trailers failed", e))?;
                Ok(None)
            }
        }
    }
}
