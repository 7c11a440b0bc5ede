//! Subresource integrity: parse SRI metadata, accumulate digests over the
//! plaintext body, and verify on drain.
//!
//! Algorithm names are matched case-insensitively; unknown algorithms are
//! ignored unless they are the only ones listed. Any single matching digest
//! passes the check.

use base64::Engine;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha256" => Some(Self::Sha256),
            "sha384" => Some(Self::Sha384),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Expectation {
    algorithm: Algorithm,
    digest: Vec<u8>,
}

/// A parsed, validated integrity list.
#[derive(Debug, Clone)]
pub(crate) struct IntegritySet {
    expectations: Vec<Expectation>,
}

impl IntegritySet {
    /// Parse SRI metadata: whitespace-separated `algo-base64` entries.
    ///
    /// Fails with `InvalidIntegrity` when the list is non-empty but no
    /// entry uses a recognised algorithm.
    pub fn parse(metadata: &str) -> Result<Option<Self>> {
        let mut expectations = Vec::new();
        let mut saw_entry = false;
        for token in metadata.split_ascii_whitespace() {
            saw_entry = true;
            let Some((name, digest)) = token.split_once('-') else {
                continue;
            };
            let Some(algorithm) = Algorithm::parse(name) else {
                continue;
            };
            // SRI allows ?options after the digest
            let digest = digest.split('?').next().unwrap_or(digest);
            let Ok(digest) = base64::engine::general_purpose::STANDARD.decode(digest) else {
                continue;
            };
            expectations.push(Expectation { algorithm, digest });
        }

        if !saw_entry {
            return Ok(None);
        }
        if expectations.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidIntegrity,
                "no recognised integrity algorithm in list",
            ));
        }
        Ok(Some(Self { expectations }))
    }

    pub fn hasher(&self) -> IntegrityHasher {
        let mut hasher = IntegrityHasher {
            expectations: self.expectations.clone(),
            sha256: None,
            sha384: None,
            sha512: None,
        };
        for e in &hasher.expectations {
            match e.algorithm {
                Algorithm::Sha256 => {
                    hasher.sha256.get_or_insert_with(Sha256::new);
                }
                Algorithm::Sha384 => {
                    hasher.sha384.get_or_insert_with(Sha384::new);
                }
                Algorithm::Sha512 => {
                    hasher.sha512.get_or_insert_with(Sha512::new);
                }
            }
        }
        hasher
    }
}

/// Running digests over the plaintext stream.
pub(crate) struct IntegrityHasher {
    expectations: Vec<Expectation>,
    sha256: Option<Sha256>,
    sha384: Option<Sha384>,
    sha512: Option<Sha512>,
}

impl IntegrityHasher {
    pub fn update(&mut self, chunk: &[u8]) {
        if let Some(h) = &mut self.sha256 {
            h.update(chunk);
        }
        if let Some(h) = &mut self.sha384 {
            h.update(chunk);
        }
        if let Some(h) = &mut self.sha512 {
            h.update(chunk);
        }
    }

    /// Check the accumulated digests. Any single match passes.
    pub fn verify(self) -> Result<()> {
        let sha256 = self.sha256.map(|h| h.finalize().to_vec());
        let sha384 = self.sha384.map(|h| h.finalize().to_vec());
        let sha512 = self.sha512.map(|h| h.finalize().to_vec());
        let matched = self.expectations.iter().any(|e| {
            let actual = match e.algorithm {
                Algorithm::Sha256 => &sha256,
                Algorithm::Sha384 => &sha384,
                Algorithm::Sha512 => &sha512,
            };
            actual.as_deref() == Some(e.digest.as_slice())
        });
        if matched {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::IntegrityMismatch,
                "no integrity digest matched the response body",
            ))
        }
    }
}
