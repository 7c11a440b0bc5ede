//! Transparent response decompression: gzip, deflate, brotli, zstd.
//!
//! The decoder sits inside the shared body stream, so every consumer of a
//! body (and every clone) sees plaintext. Write-side decoders accumulate
//! output into an inner buffer that is drained per chunk.

use std::io::Write;

use bytes::Bytes;
use flate2::write::{DeflateDecoder, GzDecoder, ZlibDecoder};
use http::HeaderMap;
use tracing::trace;

use crate::error::{Error, ErrorKind, Result};

const BROTLI_BUFFER: usize = 4096;

/// `deflate` in the wild is either zlib-wrapped (RFC 2616's intent) or raw;
/// sniffed from the first byte.
enum DeflateState {
    Pending,
    Zlib(ZlibDecoder<Vec<u8>>),
    Raw(DeflateDecoder<Vec<u8>>),
}

pub(crate) enum ContentDecoder {
    Identity,
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(DeflateState),
    Brotli(Box<brotli::DecompressorWriter<Vec<u8>>>),
    Zstd(zstd::stream::write::Decoder<'static, Vec<u8>>),
}

impl ContentDecoder {
    /// Pick a decoder from the response's `Content-Encoding`.
    ///
    /// Unknown or multi-layer encodings pass through untouched; the caller
    /// sees the raw bytes rather than an error.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let encoding = headers
            .get(http::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_default();
        match encoding.as_str() {
            "gzip" | "x-gzip" => Self::Gzip(GzDecoder::new(Vec::new())),
            "deflate" => Self::Deflate(DeflateState::Pending),
            "br" => Self::Brotli(Box::new(brotli::DecompressorWriter::new(
                Vec::new(),
                BROTLI_BUFFER,
            ))),
            "zstd" => match zstd::stream::write::Decoder::new(Vec::new()) {
                Ok(decoder) => Self::Zstd(decoder),
                Err(_) => Self::Identity,
            },
            "" | "identity" => Self::Identity,
            other => {
                trace!(encoding = other, "unrecognised content-encoding; passing through");
                Self::Identity
            }
        }
    }

    /// Decode one wire chunk into plaintext bytes (possibly empty).
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Bytes> {
        match self {
            Self::Identity => Ok(Bytes::copy_from_slice(chunk)),
            Self::Gzip(decoder) => {
                write_decoded(decoder, chunk)?;
                Ok(take_buffer(decoder.get_mut()))
            }
            Self::Deflate(state) => {
                if let DeflateState::Pending = state {
                    if chunk.is_empty() {
                        return Ok(Bytes::new());
                    }
                    // zlib streams start with a CMF byte whose low nibble is 8
                    *state = if chunk[0] & 0x0f == 0x08 {
                        DeflateState::Zlib(ZlibDecoder::new(Vec::new()))
                    } else {
                        DeflateState::Raw(DeflateDecoder::new(Vec::new()))
                    };
                }
                match state {
                    DeflateState::Zlib(decoder) => {
                        write_decoded(decoder, chunk)?;
                        Ok(take_buffer(decoder.get_mut()))
                    }
                    DeflateState::Raw(decoder) => {
                        write_decoded(decoder, chunk)?;
                        Ok(take_buffer(decoder.get_mut()))
                    }
                    DeflateState::Pending => Ok(Bytes::new()),
                }
            }
            Self::Brotli(decoder) => {
                write_decoded(decoder.as_mut(), chunk)?;
                Ok(take_buffer(decoder.get_mut()))
            }
            Self::Zstd(decoder) => {
                write_decoded(decoder, chunk)?;
                Ok(take_buffer(decoder.get_mut()))
            }
        }
    }

    /// Flush any bytes held back by the decoder at end of stream.
    pub fn finish(&mut self) -> Result<Bytes> {
        match self {
            Self::Identity => Ok(Bytes::new()),
            Self::Gzip(decoder) => {
                decoder
                    .try_finish()
                    .map_err(|e| Error::with_source(ErrorKind::BodyStream, "gzip stream truncated", e))?;
                Ok(take_buffer(decoder.get_mut()))
            }
            Self::Deflate(DeflateState::Zlib(decoder)) => {
                decoder
                    .try_finish()
                    .map_err(|e| Error::with_source(ErrorKind::BodyStream, "deflate stream truncated", e))?;
                Ok(take_buffer(decoder.get_mut()))
            }
            Self::Deflate(DeflateState::Raw(decoder)) => {
                decoder
                    .try_finish()
                    .map_err(|e| Error::with_source(ErrorKind::BodyStream, "deflate stream truncated", e))?;
                Ok(take_buffer(decoder.get_mut()))
            }
            Self::Deflate(DeflateState::Pending) => Ok(Bytes::new()),
            Self::Brotli(decoder) => {
                decoder
                    .flush()
                    .map_err(|e| Error::with_source(ErrorKind::BodyStream, "brotli stream truncated", e))?;
                Ok(take_buffer(decoder.get_mut()))
            }
            Self::Zstd(decoder) => {
                decoder
                    .flush()
                    .map_err(|e| Error::with_source(ErrorKind::BodyStream, "zstd stream truncated", e))?;
                Ok(take_buffer(decoder.get_mut()))
            }
        }
    }
}

fn write_decoded<W: Write>(decoder: &mut W, chunk: &[u8]) -> Result<()> {
    decoder
        .write_all(chunk)
        .map_err(|e| Error::with_source(ErrorKind::BodyStream, "decompression failed", e))?;
    decoder
        .flush()
        .map_err(|e| Error::with_source(ErrorKind::BodyStream, "decompression failed", e))
}

fn take_buffer(buffer: &mut Vec<u8>) -> Bytes {
    if buffer.is_empty() {
        Bytes::new()
    } else {
        Bytes::from(std::mem::take(buffer))
    }
}

/// The `Accept-Encoding` this client advertises.
pub(crate) const ACCEPT_ENCODING: &str = "gzip, deflate, br, zstd";
