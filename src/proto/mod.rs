//! Protocol drivers: HTTP/1.1, HTTP/2, and HTTP/3.
//!
//! Each driver turns a dialed transport into a `send(head, body) ->
//! (ResponseHead, BodySource)` surface. Everything above this layer is
//! protocol-agnostic.

pub(crate) mod h1;
pub(crate) mod h2;
#[cfg(feature = "http3")]
pub(crate) mod h3;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

use crate::error::Result;
use crate::request::Body;

/// The request line / pseudo-header material common to all protocols.
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub scheme: &'static str,
    /// `host` or `host:port` as it appears on the wire.
    pub authority: String,
    /// Path plus query.
    pub target: String,
    pub headers: HeaderMap,
}

/// Parsed response head, protocol-independent.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    /// Reason phrase as sent by HTTP/1.1 peers; h2/h3 have none.
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

/// Outbound request body, after coercion and redirect rewrites.
pub(crate) enum OutboundBody {
    Empty,
    InMemory(Bytes),
    Stream(Body),
}

impl std::fmt::Debug for OutboundBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("OutboundBody::Empty"),
            Self::InMemory(bytes) => f.debug_tuple("OutboundBody::InMemory").field(bytes).finish(),
            Self::Stream(_) => f.write_str("OutboundBody::Stream(..)"),
        }
    }
}

impl OutboundBody {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::InMemory(bytes) => bytes.is_empty(),
            Self::Stream(_) => false,
        }
    }
}

/// Raw (still compressed) response byte source, one per live body.
///
/// Each variant owns its connection interaction: the h1 reader returns its
/// connection to the pool when the framing completes; h2/h3 readers hold a
/// stream guard that releases their multiplexed slot. Dropping a source
/// before EOF closes (h1) or resets (h2/h3) the underlying stream.
pub(crate) enum BodySource {
    /// HEAD, 204, 304, or a cache hit already in memory.
    Buffered(Bytes),
    H1(h1::H1BodyReader),
    H2(h2::H2BodyReader),
    #[cfg(feature = "http3")]
    H3(h3::H3BodyReader),
}

impl BodySource {
    pub fn empty() -> Self {
        Self::Buffered(Bytes::new())
    }

    /// Pull the next raw chunk; `None` means clean EOF.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match self {
            Self::Buffered(bytes) => {
                if bytes.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(std::mem::take(bytes)))
                }
            }
            Self::H1(reader) => reader.next_chunk().await,
            Self::H2(reader) => reader.next_chunk().await,
            #[cfg(feature = "http3")]
            Self::H3(reader) => reader.next_chunk().await,
        }
    }
}
