//! The response body engine: a shared, one-shot, lazily-pulled byte stream.
//!
//! A handle is *Fresh* until a consumer observes it, *Streaming* while a
//! reader exists, and *Settled* once fully drained. Clones are only legal
//! while Fresh and share one underlying stream: the first consumer's pull
//! populates a retained chunk buffer that later clones replay without a
//! second network read. Decompression and integrity hashing happen inside
//! the shared stream, so every consumer sees identical plaintext.
//!
//! Connection reuse hangs off this type: the h1 reader inside the source
//! returns its connection to the pool when the framing completes, and
//! dropping an unread handle drops the source, closing (h1) or resetting
//! (h2/h3) the underlying stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, trace};
use url::Url;

use crate::cache::HttpCache;
use crate::decode::ContentDecoder;
use crate::error::{Error, ErrorKind, Result};
use crate::integrity::IntegrityHasher;
use crate::proto::BodySource;
use crate::signal::AbortSignal;
use crate::stats::Counters;

/// Deferred cache write, performed when the stream settles with its full
/// decoded bytes in hand.
pub(crate) struct CachePut {
    pub cache: Arc<HttpCache>,
    pub method: Method,
    pub url: Url,
    pub request_headers: HeaderMap,
    pub status: StatusCode,
    pub response_headers: HeaderMap,
}

struct StreamInner {
    source: Option<BodySource>,
    decoder: ContentDecoder,
    hasher: Option<IntegrityHasher>,
    /// Decoded chunks kept for clone replay and/or the cache write.
    buffer: Vec<Bytes>,
    retain: bool,
    done: bool,
    /// Sticky failure replayed to every subsequent reader.
    failure: Option<(ErrorKind, String)>,
    read_timeout: Option<Duration>,
    signal: AbortSignal,
    cache_put: Option<CachePut>,
}

/// One response body's shared state. Handles and readers hold this behind
/// an `Arc`; single-writer-many-reader discipline via the async lock.
pub(crate) struct SharedStream {
    inner: Mutex<StreamInner>,
    counters: Option<Arc<Counters>>,
    finished: AtomicBool,
}

impl SharedStream {
    fn settle(&self) {
        if !self.finished.swap(true, Ordering::Relaxed) {
            if let Some(counters) = &self.counters {
                counters.body_finished();
            }
        }
    }

    /// Pull the next decoded chunk for a reader positioned at `cursor`.
    async fn read_chunk(&self, cursor: &mut usize) -> Result<Option<Bytes>> {
        let mut inner = self.inner.lock().await;
        loop {
            if inner.retain && *cursor < inner.buffer.len() {
                let chunk = inner.buffer[*cursor].clone();
                *cursor += 1;
                return Ok(Some(chunk));
            }
            if let Some((kind, message)) = &inner.failure {
                return Err(Error::new(*kind, message.clone()));
            }
            if inner.done {
                return Ok(None);
            }

            match Self::pull(&mut inner).await {
                Ok(Some(decoded)) => {
                    if decoded.is_empty() {
                        continue; // decoder held the bytes back
                    }
                    if inner.retain {
                        inner.buffer.push(decoded.clone());
                        *cursor += 1;
                    }
                    return Ok(Some(decoded));
                }
                Ok(None) => {
                    if let Err(err) = self.finalize(&mut inner).await {
                        inner.failure = Some((err.kind(), err.message().to_string()));
                        inner.done = true;
                        inner.source = None;
                        return Err(err);
                    }
                    // loop re-checks done and returns EOF
                }
                Err(err) => {
                    inner.failure = Some((err.kind(), err.message().to_string()));
                    inner.source = None; // closes or resets the stream
                    inner.done = true;
                    return Err(err);
                }
            }
        }
    }

    /// One raw read from the source: abort- and timeout-guarded, decoded,
    /// hashed.
    async fn pull(inner: &mut StreamInner) -> Result<Option<Bytes>> {
        let read_timeout = inner.read_timeout;
        let signal = inner.signal.clone();
        signal.check()?;
        let Some(source) = inner.source.as_mut() else {
            return Ok(None);
        };
        let raw = {
            let read = source.next_chunk();
            tokio::pin!(read);
            let guarded = async move {
                match read_timeout {
                    Some(budget) => tokio::time::timeout(budget, read)
                        .await
                        .map_err(|_| {
                            Error::new(
                                ErrorKind::Timeout,
                                format!("body read exceeded {budget:?}"),
                            )
                        })?,
                    None => read.await,
                }
            };
            tokio::select! {
                res = guarded => res?,
                () = signal.cancelled() => {
                    return Err(Error::new(ErrorKind::Aborted, "request aborted"));
                }
            }
        };

        match raw {
            Some(chunk) => {
                let decoded = inner.decoder.feed(&chunk)?;
                if let Some(hasher) = &mut inner.hasher {
                    hasher.update(&decoded);
                }
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    /// EOF from the wire: flush the decoder, verify integrity, settle, and
    /// fire the deferred cache write.
    async fn finalize(&self, inner: &mut StreamInner) -> Result<()> {
        let tail = inner.decoder.finish()?;
        if !tail.is_empty() {
            if let Some(hasher) = &mut inner.hasher {
                hasher.update(&tail);
            }
            if inner.retain {
                inner.buffer.push(tail);
            }
        }
        inner.done = true;
        inner.source = None;

        if let Some(hasher) = inner.hasher.take() {
            if let Err(err) = hasher.verify() {
                debug!("integrity verification failed");
                inner.failure = Some((err.kind(), err.message().to_string()));
                self.settle();
                return Err(err);
            }
        }

        self.settle();

        if let Some(put) = inner.cache_put.take() {
            let body = concat_chunks(&inner.buffer);
            tokio::spawn(async move {
                put.cache
                    .store(
                        &put.method,
                        &put.url,
                        &put.request_headers,
                        put.status,
                        &put.response_headers,
                        &body,
                        std::time::SystemTime::now(),
                    )
                    .await;
            });
        }
        Ok(())
    }
}

fn concat_chunks(chunks: &[Bytes]) -> Bytes {
    match chunks {
        [] => Bytes::new(),
        [single] => single.clone(),
        many => {
            let mut out = BytesMut::with_capacity(many.iter().map(Bytes::len).sum());
            for chunk in many {
                out.extend_from_slice(chunk);
            }
            out.freeze()
        }
    }
}

/// One caller-visible body handle.
pub(crate) struct ResponseBody {
    shared: Arc<SharedStream>,
    disturbed: Arc<AtomicBool>,
    /// Settled-empty from birth (HEAD, 204, 304): reads yield nothing and
    /// never counted as a started body.
    empty: bool,
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody")
            .field("disturbed", &self.disturbed.load(Ordering::Relaxed))
            .field("empty", &self.empty)
            .finish()
    }
}

pub(crate) struct BodyConfig {
    pub hasher: Option<IntegrityHasher>,
    pub read_timeout: Option<Duration>,
    pub signal: AbortSignal,
    pub cache_put: Option<CachePut>,
}

impl ResponseBody {
    /// Wrap a live wire stream.
    ///
    /// `counters` is present for bodies known (or assumed) non-empty; they
    /// bump `bodies_started` now and `bodies_finished` on settling.
    /// Known-empty bodies pass `None` and stay invisible to the counters
    /// while still running decode and integrity.
    pub fn new(
        source: BodySource,
        decoder: ContentDecoder,
        config: BodyConfig,
        counters: Option<Arc<Counters>>,
    ) -> Self {
        if let Some(counters) = &counters {
            counters.body_started();
        }
        let retain = config.cache_put.is_some();
        Self {
            shared: Arc::new(SharedStream {
                inner: Mutex::new(StreamInner {
                    source: Some(source),
                    decoder,
                    hasher: config.hasher,
                    buffer: Vec::new(),
                    retain,
                    done: false,
                    failure: None,
                    read_timeout: config.read_timeout,
                    signal: config.signal,
                    cache_put: config.cache_put,
                }),
                counters,
                finished: AtomicBool::new(false),
            }),
            disturbed: Arc::new(AtomicBool::new(false)),
            empty: false,
        }
    }

    /// A body settled at birth. Never counts toward the body counters.
    pub fn settled_empty() -> Self {
        Self {
            shared: Arc::new(SharedStream {
                inner: Mutex::new(StreamInner {
                    source: None,
                    decoder: ContentDecoder::Identity,
                    hasher: None,
                    buffer: Vec::new(),
                    retain: false,
                    done: true,
                    failure: None,
                    read_timeout: None,
                    signal: AbortSignal::never(),
                    cache_put: None,
                }),
                counters: None,
                finished: AtomicBool::new(true),
            }),
            disturbed: Arc::new(AtomicBool::new(false)),
            empty: true,
        }
    }

    /// A body served from a buffer (cache hits).
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self {
            shared: Arc::new(SharedStream {
                inner: Mutex::new(StreamInner {
                    source: Some(BodySource::Buffered(bytes)),
                    decoder: ContentDecoder::Identity,
                    hasher: None,
                    buffer: Vec::new(),
                    retain: false,
                    done: false,
                    failure: None,
                    read_timeout: None,
                    signal: AbortSignal::never(),
                    cache_put: None,
                }),
                counters: None,
                finished: AtomicBool::new(true),
            }),
            disturbed: Arc::new(AtomicBool::new(false)),
            empty: false,
        }
    }

    pub fn is_settled_empty(&self) -> bool {
        self.empty
    }

    /// `bodyUsed` in fetch terms.
    pub fn is_disturbed(&self) -> bool {
        self.disturbed.load(Ordering::Relaxed)
    }

    fn disturb(&self) -> Result<()> {
        if self.disturbed.swap(true, Ordering::Relaxed) {
            Err(Error::new(
                ErrorKind::ResponseAlreadyDisturbed,
                "response body was already consumed",
            ))
        } else {
            Ok(())
        }
    }

    /// Duplicate the handle. Legal only while Fresh; both handles replay
    /// the same decoded bytes from the shared buffer.
    pub fn try_clone(&self) -> Result<Self> {
        if self.is_disturbed() {
            return Err(Error::new(
                ErrorKind::ResponseAlreadyDisturbed,
                "cannot clone a disturbed response",
            ));
        }
        if !self.empty {
            // from now on the shared stream must retain chunks for replay
            if let Ok(mut inner) = self.shared.inner.try_lock() {
                inner.retain = true;
            } else {
                // a reader holds the lock, which means a consumer exists
                return Err(Error::new(
                    ErrorKind::ResponseAlreadyDisturbed,
                    "cannot clone a streaming response",
                ));
            }
        }
        Ok(Self {
            shared: Arc::clone(&self.shared),
            disturbed: Arc::new(AtomicBool::new(false)),
            empty: self.empty,
        })
    }

    /// Consume the whole stream and return the decoded bytes.
    pub async fn drain(&self) -> Result<Bytes> {
        self.disturb()?;
        if self.empty {
            return Ok(Bytes::new());
        }
        let mut cursor = 0usize;
        let mut chunks: Vec<Bytes> = Vec::new();
        while let Some(chunk) = self.shared.read_chunk(&mut cursor).await? {
            chunks.push(chunk);
        }
        trace!(bytes = chunks.iter().map(Bytes::len).sum::<usize>(), "body drained");
        Ok(concat_chunks(&chunks))
    }

    /// Transition to Streaming and hand out a pull reader.
    pub fn reader(&self) -> Result<BodyReader> {
        self.disturb()?;
        Ok(BodyReader {
            shared: Arc::clone(&self.shared),
            cursor: 0,
            empty: self.empty,
        })
    }
}

/// Pull-based reader over the shared stream.
pub struct BodyReader {
    shared: Arc<SharedStream>,
    cursor: usize,
    empty: bool,
}

impl BodyReader {
    /// The next decoded chunk, or `None` at end of stream.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        if self.empty {
            return Ok(None);
        }
        self.shared.read_chunk(&mut self.cursor).await
    }

    /// Adapt into a `futures::Stream` of decoded chunks.
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<Bytes>> + Send {
        futures::stream::unfold(self, |mut reader| async move {
            match reader.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), reader)),
                Ok(None) => None,
                Err(err) => Some((Err(err), reader)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_body(bytes: &'static [u8], counters: &Arc<Counters>) -> ResponseBody {
        ResponseBody::new(
            BodySource::Buffered(Bytes::from_static(bytes)),
            ContentDecoder::Identity,
            BodyConfig {
                hasher: None,
                read_timeout: None,
                signal: AbortSignal::never(),
                cache_put: None,
            },
            Some(Arc::clone(counters)),
        )
    }

    #[tokio::test]
    async fn drain_settles_and_counts() {
        let counters = Arc::new(Counters::default());
        let body = live_body(b"hello", &counters);
        assert_eq!(counters.snapshot().bodies_started, 1);
        assert_eq!(counters.snapshot().bodies_finished, 0);

        let bytes = body.drain().await.unwrap();
        assert_eq!(&bytes[..], b"hello");
        assert_eq!(counters.snapshot().bodies_finished, 1);
    }

    #[tokio::test]
    async fn second_drain_is_disturbed() {
        let counters = Arc::new(Counters::default());
        let body = live_body(b"x", &counters);
        body.drain().await.unwrap();
        let err = body.drain().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResponseAlreadyDisturbed);
    }

    #[tokio::test]
    async fn reader_then_drain_is_disturbed() {
        let counters = Arc::new(Counters::default());
        let body = live_body(b"x", &counters);
        let _reader = body.reader().unwrap();
        assert!(body.is_disturbed());
        let err = body.drain().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResponseAlreadyDisturbed);
    }

    #[tokio::test]
    async fn clone_pair_sees_identical_bytes_and_counts_once() {
        let counters = Arc::new(Counters::default());
        let body = live_body(b"shared body bytes", &counters);
        let clone = body.try_clone().unwrap();

        let a = body.drain().await.unwrap();
        let b = clone.drain().await.unwrap();
        assert_eq!(a, b);

        let stats = counters.snapshot();
        assert_eq!(stats.bodies_started, 1);
        assert_eq!(stats.bodies_finished, 1);
    }

    #[tokio::test]
    async fn clone_after_drain_rejected() {
        let counters = Arc::new(Counters::default());
        let body = live_body(b"x", &counters);
        body.drain().await.unwrap();
        let err = body.try_clone().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResponseAlreadyDisturbed);
    }

    #[tokio::test]
    async fn settled_empty_never_counts() {
        let body = ResponseBody::settled_empty();
        assert!(body.is_settled_empty());
        let bytes = body.drain().await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn reader_streams_chunks() {
        let counters = Arc::new(Counters::default());
        let body = live_body(b"streamed", &counters);
        let mut reader = body.reader().unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = reader.chunk().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"streamed");
        assert_eq!(counters.snapshot().bodies_finished, 1);
    }

    #[tokio::test]
    async fn integrity_mismatch_surfaces_at_drain() {
        use crate::integrity::IntegritySet;
        let counters = Arc::new(Counters::default());
        let set = IntegritySet::parse("sha256-AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .unwrap()
            .unwrap();
        let body = ResponseBody::new(
            BodySource::Buffered(Bytes::from_static(b"not the digest")),
            ContentDecoder::Identity,
            BodyConfig {
                hasher: Some(set.hasher()),
                read_timeout: None,
                signal: AbortSignal::never(),
                cache_put: None,
            },
            Some(Arc::clone(&counters)),
        );
        let err = body.drain().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityMismatch);
    }

    #[tokio::test]
    async fn abort_mid_stream_fails_reader() {
        let controller = crate::signal::AbortController::new();
        let counters = Arc::new(Counters::default());
        // a pending source that never yields: use a buffered source but abort
        // before reading
        controller.abort();
        let body = ResponseBody::new(
            BodySource::Buffered(Bytes::from_static(b"late")),
            ContentDecoder::Identity,
            BodyConfig {
                hasher: None,
                read_timeout: None,
                signal: controller.signal(),
                cache_put: None,
            },
            Some(Arc::clone(&counters)),
        );
        let err = body.drain().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
    }
}
